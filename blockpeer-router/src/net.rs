use std::sync::Arc;

use crate::types::PeerId;

/// Exposes the underlying transport: a per-peer HTTP client and, for the
/// HTTPS listener, a shared TLS server config. Mirrors the original's
/// `router.Net().RoundTripperFor(peerID)` / `DefaultTLSConfig()` pair.
pub trait Net: Send + Sync {
    /// An HTTP client suitable for talking to `peer`. A real implementation
    /// may pin this to a connection that's already been authenticated over
    /// the libp2p transport; the default mock just returns a plain client.
    fn client_for(&self, peer: &PeerId) -> reqwest::Client;

    /// TLS server config for the HTTPS listener, if one has been
    /// provisioned (e.g. from a cluster-issued certificate). `None` means
    /// the caller should only bind the plain HTTP listener.
    fn server_tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        None
    }
}

/// A `Net` that hands out one shared, unauthenticated client. Good enough
/// for tests and for a DHT implementation that doesn't need per-peer
/// connection pinning.
#[derive(Clone)]
pub struct SharedClientNet {
    client: reqwest::Client,
}

impl SharedClientNet {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("default reqwest client config is always valid"),
        }
    }
}

impl Default for SharedClientNet {
    fn default() -> Self {
        Self::new()
    }
}

impl Net for SharedClientNet {
    fn client_for(&self, _peer: &PeerId) -> reqwest::Client {
        self.client.clone()
    }
}
