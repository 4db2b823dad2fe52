use std::sync::Arc;

use blockpeer_cache::ContentKey;
use blockpeer_router::Router;
use futures::StreamExt;
use log::debug;

use crate::error::Error;
use crate::PEER_HEADER;

/// `Fstat`/`Pread` over a peer discovered through the router, the way
/// `peoci::ocidist::Client` wraps `reqwest::Client` for registry fetches —
/// here the "registry" is whichever peer `Router::resolve` yields first.
pub struct RemoteReader {
    router: Arc<dyn Router>,
    resolve_retries: usize,
}

impl RemoteReader {
    pub fn new(router: Arc<dyn Router>, resolve_retries: usize) -> Self {
        Self {
            router,
            resolve_retries,
        }
    }

    /// Fills the object's total size from the first peer that answers a
    /// HEAD successfully. Exhaustion of peers is a not-found, per §4.4.
    pub async fn fstat(&self, key: &ContentKey) -> Result<u64, Error> {
        let mut stream = self
            .router
            .resolve(key.as_str(), false, self.resolve_retries)
            .await;
        while let Some(endpoint) = stream.next().await {
            let client = self.router.net().client_for(&endpoint.peer_id);
            let url = format!("{}/blobs/{}", endpoint.http_host, key.as_str());
            match client.head(&url).header(PEER_HEADER, "true").send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Some(len) = resp.content_length() {
                        return Ok(len);
                    }
                    debug!("peer {} answered HEAD {key} without content-length", endpoint.peer_id);
                }
                Ok(resp) => {
                    debug!("peer {} HEAD {key} returned {}", endpoint.peer_id, resp.status());
                }
                Err(e) => {
                    debug!("peer {} HEAD {key} failed: {e}", endpoint.peer_id);
                }
            }
        }
        Err(Error::NotFound(key.as_str().to_string()))
    }

    /// A retryable fetch of exactly `len` bytes at `offset`: each peer that
    /// fails the ranged GET is treated as transient and the resolver's next
    /// candidate is tried, matching §4.4's "retryable error inside fetch".
    pub async fn pread(&self, key: &ContentKey, offset: u64, len: u64) -> Result<Vec<u8>, Error> {
        let mut stream = self
            .router
            .resolve(key.as_str(), false, self.resolve_retries)
            .await;
        let range = format!("bytes={}-{}", offset, offset + len.saturating_sub(1));
        while let Some(endpoint) = stream.next().await {
            let client = self.router.net().client_for(&endpoint.peer_id);
            let url = format!("{}/blobs/{}", endpoint.http_host, key.as_str());
            match client
                .get(&url)
                .header(PEER_HEADER, "true")
                .header(reqwest::header::RANGE, range.clone())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    debug!("peer {} GET {key} returned {}", endpoint.peer_id, resp.status());
                }
                Err(e) => {
                    debug!("peer {} GET {key} failed: {e}", endpoint.peer_id);
                }
            }
        }
        Err(Error::NotFound(key.as_str().to_string()))
    }
}
