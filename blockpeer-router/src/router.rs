use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use log::debug;

use crate::negative_cache::NegativeCache;
use crate::net::{Net, SharedClientNet};
use crate::types::{PeerEndpoint, PeerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("router is closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

pub type ResolveStream = Pin<Box<dyn Stream<Item = PeerEndpoint> + Send>>;

/// Invoked by the caller iff an attempt yielded no endpoints, to seed the
/// negative cache. Kept for callers that detect exhaustion themselves (e.g.
/// via their own timeout racing the stream) — ordinary `resolve` already
/// seeds the negative cache on exhaustion internally, so invoking this is
/// harmless but usually redundant. See DESIGN.md for why this crate departs
/// from leaving seeding purely advisory.
pub type NegativeCacheCallback = Box<dyn FnOnce() + Send>;

pub const DEFAULT_RESOLVE_RETRIES: usize = 3;
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

/// DHT-backed peer discovery (spec §4.2). Implementations are consumed
/// behind this trait everywhere else in the crate graph — the mirror proxy
/// and file store never know whether they're talking to `Libp2pRouter` or
/// `MockRouter`.
#[async_trait]
pub trait Router: Send + Sync {
    /// Announces that this peer serves each key. Idempotent.
    async fn provide(&self, keys: &[String]) -> Result<(), Error>;

    /// A lazy, finite stream of endpoints for `key`, in DHT-arrival order,
    /// deduplicated by `PeerId`, filtered to exclude this router's own
    /// identity unless `allow_self` is set. Ends after `max_retries`
    /// provider lookups have completed.
    async fn resolve(&self, key: &str, allow_self: bool, max_retries: usize) -> ResolveStream;

    /// Identical to `resolve`, plus an explicit negative-cache-seeding
    /// callback for callers that need to react to exhaustion on their own
    /// terms (e.g. an enclosing deadline firing before the stream
    /// completes).
    async fn resolve_with_negative_cache_callback(
        &self,
        key: &str,
        allow_self: bool,
        max_retries: usize,
    ) -> (ResolveStream, NegativeCacheCallback);

    /// In-memory only; does not touch the DHT.
    fn lookup_key(&self, key: &str) -> Vec<PeerEndpoint>;

    fn net(&self) -> Arc<dyn Net>;

    async fn close(&self);
}

/// In-memory router for tests, grounded on the upstream's
/// `pkg/discovery/routing/mocks` router: a fixed map of key to providers,
/// seeded at construction, plus whatever this instance has `provide()`d for
/// itself.
pub struct MockRouter {
    self_id: PeerId,
    self_http_host: String,
    providers: Mutex<HashMap<String, Vec<PeerEndpoint>>>,
    negative_cache: Arc<NegativeCache>,
    net: Arc<dyn Net>,
    closed: Mutex<bool>,
}

impl MockRouter {
    pub fn new(
        self_id: PeerId,
        self_http_host: impl Into<String>,
        seed: HashMap<String, Vec<PeerEndpoint>>,
    ) -> Self {
        Self {
            self_id,
            self_http_host: self_http_host.into(),
            providers: Mutex::new(seed),
            negative_cache: Arc::new(NegativeCache::new(DEFAULT_NEGATIVE_CACHE_TTL)),
            net: Arc::new(SharedClientNet::new()),
            closed: Mutex::new(false),
        }
    }

    fn candidates(&self, key: &str, allow_self: bool, max_retries: usize) -> Vec<PeerEndpoint> {
        let providers = self.providers.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(list) = providers.get(key) {
            for ep in list {
                if !allow_self && ep.peer_id == self.self_id {
                    continue;
                }
                if !seen.insert(ep.peer_id.clone()) {
                    continue;
                }
                out.push(ep.clone());
                if out.len() >= max_retries {
                    break;
                }
            }
        }
        out
    }
}

#[async_trait]
impl Router for MockRouter {
    async fn provide(&self, keys: &[String]) -> Result<(), Error> {
        let mut providers = self.providers.lock().unwrap();
        let self_endpoint = PeerEndpoint {
            peer_id: self.self_id.clone(),
            http_host: self.self_http_host.clone(),
        };
        for key in keys {
            let entry = providers.entry(key.clone()).or_default();
            if !entry.contains(&self_endpoint) {
                entry.push(self_endpoint.clone());
            }
        }
        Ok(())
    }

    async fn resolve(&self, key: &str, allow_self: bool, max_retries: usize) -> ResolveStream {
        if self.negative_cache.contains(key) {
            debug!("resolve {key} short-circuited by negative cache");
            return Box::pin(tokio_stream::empty());
        }
        let candidates = self.candidates(key, allow_self, max_retries);
        if candidates.is_empty() {
            self.negative_cache.insert(key);
        }
        Box::pin(tokio_stream::iter(candidates))
    }

    async fn resolve_with_negative_cache_callback(
        &self,
        key: &str,
        allow_self: bool,
        max_retries: usize,
    ) -> (ResolveStream, NegativeCacheCallback) {
        if self.negative_cache.contains(key) {
            return (Box::pin(tokio_stream::empty()), Box::new(|| {}));
        }
        let candidates = self.candidates(key, allow_self, max_retries);
        if candidates.is_empty() {
            self.negative_cache.insert(key);
        }
        let negative_cache = self.negative_cache.clone();
        let owned_key = key.to_string();
        let callback: NegativeCacheCallback = Box::new(move || negative_cache.insert(&owned_key));
        (Box::pin(tokio_stream::iter(candidates)), callback)
    }

    fn lookup_key(&self, key: &str) -> Vec<PeerEndpoint> {
        self.providers
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn net(&self) -> Arc<dyn Net> {
        self.net.clone()
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn endpoint(id: &str, host: &str) -> PeerEndpoint {
        PeerEndpoint {
            peer_id: PeerId(id.to_string()),
            http_host: host.to_string(),
        }
    }

    fn router_with(seed: HashMap<String, Vec<PeerEndpoint>>) -> MockRouter {
        MockRouter::new(PeerId("self".to_string()), "http://self:8080", seed)
    }

    #[tokio::test]
    async fn resolve_yields_seeded_providers() {
        let mut seed = HashMap::new();
        seed.insert("key1".to_string(), vec![endpoint("p1", "value1")]);
        let router = router_with(seed);

        let mut stream = router.resolve("key1", false, 1).await;
        let first = stream.next().await.unwrap();
        assert_eq!(first.http_host, "value1");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_key_closes_immediately() {
        let router = router_with(HashMap::new());
        let mut stream = router.resolve("key2", false, 1).await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn resolve_with_negative_cache_callback_seeds_on_invoke() {
        let router = router_with(HashMap::new());
        let (mut stream, callback) = router
            .resolve_with_negative_cache_callback("missing", false, 1)
            .await;
        assert!(stream.next().await.is_none());
        callback();
        assert!(router.negative_cache.contains("missing"));
    }

    #[tokio::test]
    async fn negative_cache_short_circuits_subsequent_resolve() {
        let router = router_with(HashMap::new());
        let mut first = router.resolve("missing", false, 1).await;
        assert!(first.next().await.is_none());

        // Seeded by the exhausted attempt above; a fresh resolve should not
        // need to consult `providers` again (asserted indirectly: it still
        // closes immediately even though nothing else changed).
        let mut second = router.resolve("missing", false, 1).await;
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn lookup_key_is_in_memory_only() {
        let mut seed = HashMap::new();
        seed.insert("key1".to_string(), vec![endpoint("p1", "value1")]);
        let router = router_with(seed);
        let found = router.lookup_key("key1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].http_host, "value1");
    }

    #[tokio::test]
    async fn provide_is_idempotent() {
        let router = router_with(HashMap::new());
        router.provide(&["k1".to_string()]).await.unwrap();
        router.provide(&["k1".to_string()]).await.unwrap();
        let found = router.lookup_key("k1");
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn allow_self_false_filters_self_from_resolve() {
        let mut seed = HashMap::new();
        seed.insert(
            "k1".to_string(),
            vec![endpoint("self", "http://self:8080")],
        );
        let router = router_with(seed);
        let mut stream = router.resolve("k1", false, 3).await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn allow_self_true_includes_self() {
        let mut seed = HashMap::new();
        seed.insert(
            "k1".to_string(),
            vec![endpoint("self", "http://self:8080")],
        );
        let router = router_with(seed);
        let mut stream = router.resolve("k1", true, 3).await;
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn close_is_ok() {
        let router = router_with(HashMap::new());
        router.close().await;
    }
}
