use std::sync::Arc;

use blockpeer_cache::{BlockCache, ContentKey};
use log::{debug, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::file::fill_block;
use crate::local_store::LocalStore;
use crate::remote_reader::RemoteReader;

const QUEUE_CAPACITY: usize = 256;

struct Job {
    key: ContentKey,
    offset: u64,
    local_store: Arc<dyn LocalStore>,
    remote: Arc<RemoteReader>,
}

/// Cheap, cloneable handle to the prefetch job queue. Submitting is
/// best-effort: a full or closed queue silently drops the job, per §4.4
/// ("prefetch is best-effort: errors are logged, never surfaced").
#[derive(Clone)]
pub struct PrefetchHandle {
    tx: mpsc::Sender<Job>,
}

impl PrefetchHandle {
    pub fn submit(
        &self,
        key: ContentKey,
        offset: u64,
        local_store: Arc<dyn LocalStore>,
        remote: Arc<RemoteReader>,
    ) {
        let job = Job {
            key,
            offset,
            local_store,
            remote,
        };
        if self.tx.try_send(job).is_err() {
            debug!("prefetch queue full or idle, dropping job");
        }
    }
}

/// Bounded worker pool draining prefetch jobs (spec §4.4, component E).
/// `worker_count = 0` disables prefetch: the queue exists but nothing ever
/// drains it, so `submit` degrades to a no-op once it fills.
pub struct PrefetchPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl PrefetchPool {
    pub fn new(cache: BlockCache, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = rx.clone();
            let cache = cache.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    run_job(&cache, job).await;
                }
            }));
        }
        Self { tx, workers }
    }

    pub fn handle(&self) -> PrefetchHandle {
        PrefetchHandle { tx: self.tx.clone() }
    }

    /// Graceful drain per spec §9: close the job channel, join the
    /// workers, then the caller closes the cache's new-block channel that
    /// feeds the advertiser.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_job(cache: &BlockCache, job: Job) {
    let Job {
        key,
        offset,
        local_store,
        remote,
    } = job;
    let key_for_fill = key.clone();
    let result = cache
        .get_or_create(&key, offset, move || {
            fill_block(key_for_fill, offset, local_store, remote)
        })
        .await;
    if let Err(e) = result {
        warn!("prefetch fill failed for {key} offset={offset}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::NullLocalStore;
    use blockpeer_router::{MockRouter, PeerId, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn disabled_pool_drops_jobs_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        let pool = PrefetchPool::new(cache.clone(), 0);
        let router: Arc<dyn Router> = Arc::new(MockRouter::new(
            PeerId("self".to_string()),
            "http://self",
            HashMap::new(),
        ));
        let remote = Arc::new(RemoteReader::new(router, 1));
        let local = Arc::new(NullLocalStore);
        let key = ContentKey::parse("sha256:aaaa").unwrap();
        pool.handle().submit(key, 0, local, remote);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn worker_runs_submitted_job() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        let pool = PrefetchPool::new(cache.clone(), 1);

        let router: Arc<dyn Router> = Arc::new(MockRouter::new(
            PeerId("self".to_string()),
            "http://self",
            HashMap::new(),
        ));
        let remote = Arc::new(RemoteReader::new(router, 1));

        struct CountingStore {
            calls: Arc<AtomicUsize>,
        }
        #[async_trait::async_trait]
        impl LocalStore for CountingStore {
            async fn size(&self, _key: &ContentKey) -> std::io::Result<Option<u64>> {
                Ok(Some(4))
            }
            async fn read_range(
                &self,
                _key: &ContentKey,
                _offset: u64,
                _len: u64,
            ) -> std::io::Result<Option<Vec<u8>>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(vec![1, 2, 3, 4]))
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let local = Arc::new(CountingStore {
            calls: calls.clone(),
        });
        let key = ContentKey::parse("sha256:bbbb").unwrap();
        pool.handle().submit(key.clone(), 0, local, remote);
        pool.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.exists(&key, 0));
    }
}
