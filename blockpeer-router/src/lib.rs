mod libp2p_router;
mod negative_cache;
mod net;
mod router;
mod types;

pub use libp2p_router::{Libp2pRouter, Libp2pRouterConfig};
pub use net::{Net, SharedClientNet};
pub use router::{
    Error, MockRouter, NegativeCacheCallback, ResolveStream, Router, DEFAULT_NEGATIVE_CACHE_TTL,
    DEFAULT_RESOLVE_RETRIES, DEFAULT_RESOLVE_TIMEOUT,
};
pub use types::{PeerEndpoint, PeerId};
