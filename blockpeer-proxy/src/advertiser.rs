use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockpeer_router::Router;
use log::warn;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use tokio::sync::mpsc;

static ADVERTISE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "advertise_errors_total",
        "Number of router.Provide calls that failed"
    )
    .unwrap()
});

/// Long-running consumer of the cache's new-block channel (spec §4.5,
/// component G): calls `router.provide` for each block, logs and continues
/// on error, exits when the channel closes.
pub struct Advertiser {
    last_advertised_at: AtomicU64,
}

impl Advertiser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_advertised_at: AtomicU64::new(0),
        })
    }

    /// Seconds since the Unix epoch of the last successful advertisement,
    /// or 0 if none yet. Exposed as a gauge on `/metrics`.
    pub fn last_advertised_at(&self) -> u64 {
        self.last_advertised_at.load(Ordering::Relaxed)
    }

    pub async fn run(
        self: Arc<Self>,
        router: Arc<dyn Router>,
        mut new_blocks: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(advertised_key) = new_blocks.recv().await {
            match router.provide(&[advertised_key.clone()]).await {
                Ok(()) => {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    self.last_advertised_at.store(now, Ordering::Relaxed);
                }
                Err(e) => {
                    ADVERTISE_ERRORS_TOTAL.inc();
                    warn!("provide failed for {advertised_key}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockpeer_router::{MockRouter, PeerId};
    use std::collections::HashMap;

    #[tokio::test]
    async fn advertises_each_new_block() {
        let router: Arc<dyn Router> = Arc::new(MockRouter::new(
            PeerId("self".to_string()),
            "http://self",
            HashMap::new(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let advertiser = Advertiser::new();

        tx.send("sha256:aaaa_0-1048575".to_string()).unwrap();
        drop(tx);

        advertiser.clone().run(router.clone(), rx).await;
        assert!(advertiser.last_advertised_at() > 0);
        assert_eq!(
            router.lookup_key("sha256:aaaa_0-1048575").len(),
            1
        );
    }
}
