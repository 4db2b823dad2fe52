//! Block-aligned, content-addressed, disk-backed cache (spec §4.1/§4.2 of
//! the design this crate implements): bounded, concurrent, single-flight
//! fill, batch eviction in insertion order.

mod cache;
mod index;
mod key;

pub use cache::{BlockCache, BlockCacheBuilder, Error, LenMarker, Stats};
pub use index::CacheIndex;
pub use key::{BlockId, ContentKey, ParseError, BLOCK_SIZE};
