use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Semaphore};

use crate::index::CacheIndex;
use crate::key::{BlockId, ContentKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fill function failed: {0}")]
    Fill(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct BlockCacheBuilder {
    root: PathBuf,
    capacity: usize,
    evict_pct: u8,
}

impl BlockCacheBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capacity: 10_000,
            evict_pct: 10,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn evict_pct(mut self, evict_pct: u8) -> Self {
        self.evict_pct = evict_pct;
        self
    }

    /// Builds the cache and, if `root` already has content, repopulates the
    /// index from the on-disk layout (`<root>/<alg>/<hex>/<offset>`) so
    /// blocks written by a prior process are rediscovered rather than
    /// silently orphaned.
    pub fn build(self) -> io::Result<(BlockCache, mpsc::UnboundedReceiver<String>)> {
        std::fs::create_dir_all(&self.root)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let index = CacheIndex::new(self.capacity, self.evict_pct);
        let loaded = reconcile_from_disk(&self.root, &index)?;
        if loaded > 0 {
            info!("reconciled {loaded} existing blocks from {:?}", self.root);
        }

        let cache = BlockCache {
            inner: Arc::new(Inner {
                root: self.root,
                index,
                fill_locks: Mutex::new(HashMap::new()),
                new_block_tx: tx,
                counters: Counters::default(),
            }),
        };
        Ok((cache, rx))
    }
}

fn reconcile_from_disk<V: Clone>(root: &Path, index: &CacheIndex<V>) -> io::Result<usize>
where
    V: From<u64>,
{
    let mut count = 0;
    let Ok(algo_dirs) = std::fs::read_dir(root) else {
        return Ok(0);
    };
    for algo_dir in algo_dirs.flatten() {
        if !algo_dir.file_type()?.is_dir() {
            continue;
        }
        let Ok(hex_dirs) = std::fs::read_dir(algo_dir.path()) else {
            continue;
        };
        for hex_dir in hex_dirs.flatten() {
            if !hex_dir.file_type()?.is_dir() {
                continue;
            }
            let Ok(offset_files) = std::fs::read_dir(hex_dir.path()) else {
                continue;
            };
            for offset_file in offset_files.flatten() {
                let Ok(meta) = offset_file.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let algo = algo_dir.file_name();
                let hex = hex_dir.file_name();
                let offset = offset_file.file_name();
                let (Some(algo), Some(hex), Some(offset)) =
                    (algo.to_str(), hex.to_str(), offset.to_str())
                else {
                    continue;
                };
                let Ok(offset) = offset.parse::<u64>() else {
                    continue;
                };
                let key = format!("{algo}:{hex}|{offset}");
                index.insert(key, V::from(meta.len()));
                count += 1;
            }
        }
    }
    Ok(count)
}

impl From<u64> for LenMarker {
    fn from(v: u64) -> Self {
        LenMarker(v)
    }
}

/// Newtype so `reconcile_from_disk`'s generic bound reads cleanly; the index
/// value type is always a plain block length in bytes.
#[derive(Clone, Copy, Debug)]
pub struct LenMarker(pub u64);

struct Inner {
    root: PathBuf,
    index: CacheIndex<LenMarker>,
    fill_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    new_block_tx: mpsc::UnboundedSender<String>,
    counters: Counters,
}

/// Disk-backed, bounded, concurrent content cache (spec §4.1).
///
/// The index mutation is serialized under one coarse lock (`fill_locks`'
/// mutex plus `CacheIndex`'s own internal mutex); the per-entry lock — a
/// single-permit semaphore created lazily per key — is held by whichever
/// caller first starts filling a block, for the duration of that fill.
/// Readers of an already-complete entry never touch the semaphore at all.
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<Inner>,
}

impl BlockCache {
    pub fn builder(root: impl Into<PathBuf>) -> BlockCacheBuilder {
        BlockCacheBuilder::new(root)
    }

    /// Non-blocking, no side effects.
    pub fn exists(&self, key: &ContentKey, aligned_offset: u64) -> bool {
        let block = BlockId::new(key.clone(), aligned_offset);
        self.inner.index.contains(&block.index_key())
    }

    /// Direct read of a present block. Never fills.
    pub async fn get(&self, key: &ContentKey, aligned_offset: u64) -> Option<Arc<[u8]>> {
        let block = BlockId::new(key.clone(), aligned_offset);
        let len = self.inner.index.get(&block.index_key())?;
        self.read_block(&block, len.0).await.ok()
    }

    /// Removes a block from the index and deletes its file. No-op if absent.
    pub async fn drop_block(&self, key: &ContentKey, aligned_offset: u64) {
        let block = BlockId::new(key.clone(), aligned_offset);
        if self.inner.index.remove(&block.index_key()).is_some() {
            let path = block.disk_path(&self.inner.root);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("drop_block failed to remove {:?}: {e}", path);
                }
            }
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.inner.index.len(),
            hits: self.inner.counters.hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Atomically returns cached bytes or invokes `fill` exactly once across
    /// concurrent callers for the same `(key, aligned_offset)`. On success,
    /// persists the bytes to disk, records the index entry, publishes a
    /// new-block notification, and returns the bytes. On fill error, nothing
    /// is persisted or inserted.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &ContentKey,
        aligned_offset: u64,
        fill: F,
    ) -> Result<Arc<[u8]>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, Error>>,
    {
        let block = BlockId::new(key.clone(), aligned_offset);
        let index_key = block.index_key();

        if let Some(len) = self.inner.index.get(&index_key) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!("cache hit {index_key}");
            return self.read_block(&block, len.0).await;
        }

        let sem = {
            let mut locks = self.inner.fill_locks.lock().unwrap();
            locks
                .entry(index_key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let _permit = sem.acquire().await.expect("fill semaphore never closed");

        // Someone else may have completed the fill while we waited.
        if let Some(len) = self.inner.index.get(&index_key) {
            self.cleanup_fill_lock(&index_key);
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return self.read_block(&block, len.0).await;
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = fill().await;

        match result {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                let persisted = self.persist(&block, &bytes).await;
                if let Err(e) = persisted {
                    self.cleanup_fill_lock(&index_key);
                    return Err(e);
                }
                let evicted = self.inner.index.insert(index_key.clone(), LenMarker(len));
                self.cleanup_fill_lock(&index_key);
                self.evict_files(evicted).await;
                let elapsed = start.elapsed();
                info!(
                    "filled {index_key} len={len} elapsed={:.3}s",
                    elapsed.as_secs_f32()
                );
                let advertised = block.advertised_key(len);
                if self.inner.new_block_tx.send(advertised).is_err() {
                    debug!("new-block receiver dropped, no advertiser listening");
                }
                Ok(Arc::from(bytes.into_boxed_slice()))
            }
            Err(e) => {
                self.cleanup_fill_lock(&index_key);
                Err(e)
            }
        }
    }

    fn cleanup_fill_lock(&self, index_key: &str) {
        self.inner.fill_locks.lock().unwrap().remove(index_key);
    }

    async fn evict_files(&self, evicted_keys: Vec<String>) {
        for composite in evicted_keys {
            let Some((content_key, offset)) = composite.split_once('|') else {
                continue;
            };
            let Ok(offset) = offset.parse::<u64>() else {
                continue;
            };
            let Ok(content_key) = ContentKey::parse(content_key) else {
                continue;
            };
            let block = BlockId::new(content_key, offset);
            let path = block.disk_path(&self.inner.root);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("eviction failed to remove {:?}: {e}", path);
                }
            }
        }
    }

    async fn read_block(&self, block: &BlockId, len: u64) -> Result<Arc<[u8]>, Error> {
        let path = block.disk_path(&self.inner.root);
        let bytes = tokio::fs::read(&path).await?;
        debug_assert_eq!(bytes.len() as u64, len, "on-disk block length mismatch");
        Ok(Arc::from(bytes.into_boxed_slice()))
    }

    /// Writes to a `_tmp` sibling file and renames into place, so readers
    /// never observe a partially written block.
    async fn persist(&self, block: &BlockId, bytes: &[u8]) -> Result<(), Error> {
        let path = block.disk_path(&self.inner.root);
        let dir = path.parent().expect("block path always has a parent").to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let tmp_path = {
            let mut p = path.clone();
            let file_name = format!("{}_tmp", p.file_name().unwrap().to_string_lossy());
            p.set_file_name(file_name);
            p
        };

        let write_result = tokio::fs::write(&tmp_path, bytes).await;
        match write_result {
            Ok(()) => {
                tokio::fs::rename(&tmp_path, &path).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn key(s: &str) -> ContentKey {
        ContentKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn fill_persists_and_is_readable() {
        let dir = tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();

        let bytes = cache
            .get_or_create(&key("sha256:aaaa"), 0, || async { Ok(vec![1, 2, 3]) })
            .await
            .unwrap();
        assert_eq!(&*bytes, &[1, 2, 3]);
        assert!(cache.exists(&key("sha256:aaaa"), 0));

        let got = cache.get(&key("sha256:aaaa"), 0).await.unwrap();
        assert_eq!(&*got, &[1, 2, 3]);
    }

    #[tokio::test]
    async fn fill_error_does_not_insert() {
        let dir = tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();

        let err = cache
            .get_or_create(&key("sha256:bbbb"), 0, || async {
                Err(Error::Io(io::Error::new(io::ErrorKind::Other, "boom")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!cache.exists(&key("sha256:bbbb"), 0));
    }

    #[tokio::test]
    async fn single_flight_fill_invoked_once() {
        let dir = tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        let fill_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let fill_count = fill_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create(&key("sha256:cccc"), 0, || {
                        let fill_count = fill_count.clone();
                        async move {
                            fill_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            Ok(vec![9; 20])
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(fill_count.load(Ordering::SeqCst), 1);
        for bytes in &results {
            assert_eq!(&**bytes, &[9u8; 20][..]);
        }
    }

    #[tokio::test]
    async fn drop_block_removes_entry_and_file() {
        let dir = tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        cache
            .get_or_create(&key("sha256:dddd"), 0, || async { Ok(vec![1]) })
            .await
            .unwrap();
        assert!(cache.exists(&key("sha256:dddd"), 0));

        cache.drop_block(&key("sha256:dddd"), 0).await;
        assert!(!cache.exists(&key("sha256:dddd"), 0));

        // Dropping an absent key is a no-op.
        cache.drop_block(&key("sha256:dddd"), 0).await;
    }

    #[tokio::test]
    async fn last_block_can_be_shorter_than_block_size() {
        let dir = tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        let bytes = cache
            .get_or_create(&key("sha256:eeee"), 0, || async { Ok(vec![0u8; 10]) })
            .await
            .unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[tokio::test]
    async fn new_block_published_on_fill_success() {
        let dir = tempdir().unwrap();
        let (cache, mut rx) = BlockCache::builder(dir.path()).build().unwrap();
        cache
            .get_or_create(&key("sha256:ffff"), 0, || async { Ok(vec![1, 2, 3]) })
            .await
            .unwrap();
        let advertised = rx.try_recv().unwrap();
        assert_eq!(advertised, format!("sha256:ffff_0-2"));
    }

    #[tokio::test]
    async fn reconcile_from_disk_repopulates_index() {
        let dir = tempdir().unwrap();
        {
            let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
            cache
                .get_or_create(&key("sha256:1111"), 0, || async { Ok(vec![1, 2, 3, 4]) })
                .await
                .unwrap();
        }
        let (cache2, _rx2) = BlockCache::builder(dir.path()).build().unwrap();
        assert!(cache2.exists(&key("sha256:1111"), 0));
        assert_eq!(cache2.stats().entries, 1);
    }
}
