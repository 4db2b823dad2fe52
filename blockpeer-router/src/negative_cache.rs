use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;

/// Short-TTL memory of keys known to have no providers, used to damp
/// repeated DHT walks during a miss storm.
///
/// Grounded on the same pattern the teacher uses for registry-token expiry
/// (`peoci::ocidist::ExpireToken`): a `moka::Expiry` impl that fixes every
/// entry's lifetime at insertion time, backed by a `moka::sync::Cache`.
pub struct NegativeCache {
    cache: Cache<String, ()>,
}

struct FixedTtl(Duration);

impl Expiry<String, ()> for FixedTtl {
    fn expire_after_create(&self, _key: &String, _value: &(), _created_at: Instant) -> Option<Duration> {
        Some(self.0)
    }
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().expire_after(FixedTtl(ttl)).build(),
        }
    }

    pub fn insert(&self, key: &str) {
        self.cache.insert(key.to_string(), ());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let nc = NegativeCache::new(Duration::from_secs(60));
        assert!(!nc.contains("k"));
        nc.insert("k");
        assert!(nc.contains("k"));
    }
}
