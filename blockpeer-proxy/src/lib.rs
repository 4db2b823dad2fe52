mod advertiser;
mod error;
mod file;
mod local_store;
mod metrics;
mod mirror;
mod prefetch;
mod remote_reader;

pub use advertiser::Advertiser;
pub use error::Error;
pub use file::File;
pub use local_store::{DirLocalStore, LocalStore, NullLocalStore};
pub use mirror::{handle as mirror_handle, MirrorOutcome, MirrorRequest, ReferenceKind};
pub use prefetch::{PrefetchHandle, PrefetchPool};
pub use remote_reader::RemoteReader;

/// Set on every request a peer makes to another peer's `/blobs` endpoint so
/// the serving side restricts itself to cache-only, single-block mode and
/// never re-mirrors on a peer's behalf (spec §4.4, "fetch loop prevention").
pub const PEER_HEADER: &str = "X-Peerd-P2P";

/// Propagated across a mirror hop so logs on both sides of a multi-peer
/// attempt can be correlated, the way `peserver::worker` tags each request.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";
