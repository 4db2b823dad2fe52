use std::fmt;

/// A peer's identity on the DHT. Wraps `libp2p::PeerId`'s string form so
/// the rest of the crate (and its mocks) doesn't need the `libp2p` feature
/// set pulled into every consumer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<libp2p::PeerId> for PeerId {
    fn from(id: libp2p::PeerId) -> Self {
        Self(id.to_string())
    }
}

/// A candidate peer for a mirror request. Equality is by `peer_id` alone —
/// two endpoints for the same peer are the same endpoint even if the
/// associated host string were ever to change.
#[derive(Clone, Debug)]
pub struct PeerEndpoint {
    pub peer_id: PeerId,
    pub http_host: String,
}

impl PartialEq for PeerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}
impl Eq for PeerEndpoint {}
