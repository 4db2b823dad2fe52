use std::sync::Arc;

use blockpeer_cache::{BlockCache, BlockId, ContentKey, BLOCK_SIZE};
use tokio::sync::OnceCell;

use crate::error::Error;
use crate::local_store::LocalStore;
use crate::prefetch::PrefetchHandle;
use crate::remote_reader::RemoteReader;

/// Presents a seekable virtual file over the block cache, translating
/// `Read(range)` into `Cache.GetOrCreate` calls plus prefetch triggers
/// (spec §4.4, component H).
pub struct File {
    key: ContentKey,
    cache: BlockCache,
    remote: Arc<RemoteReader>,
    local_store: Arc<dyn LocalStore>,
    prefetch: PrefetchHandle,
    /// `Some(offset)` when this file was opened by a peer request: reads
    /// are pinned to that single aligned block, per §4.4's "restricted to
    /// the exact block they requested to prevent fetch loops".
    pinned_offset: Option<u64>,
    size: OnceCell<u64>,
}

impl File {
    /// `aligned_offset` is the block the caller is asking for; for a
    /// non-peer request it is only used to seed the prefetch window.
    pub async fn open(
        key: ContentKey,
        peer_mode: bool,
        aligned_offset: u64,
        cache: BlockCache,
        remote: Arc<RemoteReader>,
        local_store: Arc<dyn LocalStore>,
        prefetch: PrefetchHandle,
    ) -> Result<File, Error> {
        if peer_mode && !cache.exists(&key, aligned_offset) {
            return Err(Error::NotFound(key.as_str().to_string()));
        }
        Ok(File {
            pinned_offset: peer_mode.then_some(aligned_offset),
            key,
            cache,
            remote,
            local_store,
            prefetch,
            size: OnceCell::new(),
        })
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    /// Total object size, for HEAD responses. Same lazy lookup `read` uses
    /// internally.
    pub async fn size(&self) -> Result<u64, Error> {
        self.total_size().await
    }

    async fn total_size(&self) -> Result<u64, Error> {
        self.size
            .get_or_try_init(|| async {
                match self.local_store.size(&self.key).await {
                    Ok(Some(size)) => Ok(size),
                    Ok(None) => self.remote.fstat(&self.key).await,
                    Err(e) => Err(Error::Fill(blockpeer_cache::Error::Io(e))),
                }
            })
            .await
            .map(|size| *size)
    }

    /// Reads `len` bytes starting at `pos`, filling and prefetching blocks
    /// as needed. Returns fewer bytes than requested at EOF.
    pub async fn read(&self, pos: u64, len: u64) -> Result<Vec<u8>, Error> {
        let aligned = BlockId::align(pos);

        if let Some(pinned) = self.pinned_offset {
            if aligned != pinned {
                return Err(Error::NotFound(self.key.as_str().to_string()));
            }
        }

        let total_size = self.total_size().await?;
        let block = self.fill_block(aligned).await?;

        let within = (pos - aligned) as usize;
        let end = within.saturating_add(len as usize).min(block.len());
        let out = if within >= block.len() {
            Vec::new()
        } else {
            block[within..end].to_vec()
        };

        if self.pinned_offset.is_none() {
            self.trigger_prefetch(aligned, total_size);
        }

        Ok(out)
    }

    async fn fill_block(&self, aligned: u64) -> Result<Arc<[u8]>, Error> {
        let local_store = self.local_store.clone();
        let remote = self.remote.clone();
        let key = self.key.clone();
        self.cache
            .get_or_create(&self.key, aligned, move || {
                fill_block(key, aligned, local_store, remote)
            })
            .await
            .map_err(Error::Fill)
    }

    fn trigger_prefetch(&self, just_filled: u64, total_size: u64) {
        let next = just_filled + BLOCK_SIZE;
        if next >= total_size {
            return;
        }
        self.prefetch.submit(
            self.key.clone(),
            next,
            self.local_store.clone(),
            self.remote.clone(),
        );
    }
}

pub(crate) async fn fill_block(
    key: ContentKey,
    aligned: u64,
    local_store: Arc<dyn LocalStore>,
    remote: Arc<RemoteReader>,
) -> Result<Vec<u8>, blockpeer_cache::Error> {
    match local_store.read_range(&key, aligned, BLOCK_SIZE).await {
        Ok(Some(bytes)) => return Ok(bytes),
        Ok(None) => {}
        Err(e) => return Err(blockpeer_cache::Error::Io(e)),
    }
    remote
        .pread(&key, aligned, BLOCK_SIZE)
        .await
        .map_err(|e| blockpeer_cache::Error::Fill(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::NullLocalStore;
    use crate::prefetch::PrefetchPool;
    use blockpeer_router::{MockRouter, PeerId, Router};
    use std::collections::HashMap;

    fn router() -> Arc<dyn Router> {
        Arc::new(MockRouter::new(
            PeerId("self".to_string()),
            "http://self",
            HashMap::new(),
        ))
    }

    #[tokio::test]
    async fn peer_mode_rejects_uncached_block() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        let remote = Arc::new(RemoteReader::new(router(), 1));
        let local = Arc::new(NullLocalStore);
        let pool = PrefetchPool::new(cache.clone(), 0);

        let key = ContentKey::parse("sha256:aaaa").unwrap();
        let err = File::open(
            key,
            true,
            0,
            cache,
            remote,
            local,
            pool.handle(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn peer_mode_serves_cached_block() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _rx) = BlockCache::builder(dir.path()).build().unwrap();
        let key = ContentKey::parse("sha256:bbbb").unwrap();
        cache
            .get_or_create(&key, 0, || async { Ok(vec![7u8; 10]) })
            .await
            .unwrap();

        let remote = Arc::new(RemoteReader::new(router(), 1));
        let local = Arc::new(NullLocalStore);
        let pool = PrefetchPool::new(cache.clone(), 0);

        let file = File::open(key, true, 0, cache, remote, local, pool.handle())
            .await
            .unwrap();
        let bytes = file.read(0, 10).await.unwrap();
        assert_eq!(bytes, vec![7u8; 10]);
    }
}
