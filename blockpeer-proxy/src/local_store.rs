use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use blockpeer_cache::ContentKey;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// The local container runtime's content store, consulted before falling
/// back to a peer. Grounded on the original's `containerd.Store` interface
/// (`pkg/containerd/mock.go`): `Resolve`/`Size`/`Write`/`Bytes` collapsed
/// into the subset the block cache's fill path actually needs.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// `None` if the runtime has no record of this digest.
    async fn size(&self, key: &ContentKey) -> io::Result<Option<u64>>;

    /// Reads exactly `len` bytes starting at `offset`, or fewer at EOF.
    /// `None` if the digest is not present locally.
    async fn read_range(
        &self,
        key: &ContentKey,
        offset: u64,
        len: u64,
    ) -> io::Result<Option<Vec<u8>>>;
}

/// Default when no runtime integration is configured: always reports
/// not-found, so the proxy degrades to peer/DHT-only operation.
#[derive(Default, Clone, Copy)]
pub struct NullLocalStore;

#[async_trait]
impl LocalStore for NullLocalStore {
    async fn size(&self, _key: &ContentKey) -> io::Result<Option<u64>> {
        Ok(None)
    }

    async fn read_range(
        &self,
        _key: &ContentKey,
        _offset: u64,
        _len: u64,
    ) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Reads a containerd-style content directory: `<content_dir>/blobs/<algo>/<hex>`.
pub struct DirLocalStore {
    content_dir: PathBuf,
}

impl DirLocalStore {
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
        }
    }

    fn blob_path(&self, key: &ContentKey) -> Option<PathBuf> {
        let (algo, hex) = key.as_str().split_once(':')?;
        Some(self.content_dir.join("blobs").join(algo).join(hex))
    }
}

async fn open(path: &Path) -> io::Result<Option<tokio::fs::File>> {
    match tokio::fs::File::open(path).await {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl LocalStore for DirLocalStore {
    async fn size(&self, key: &ContentKey) -> io::Result<Option<u64>> {
        let Some(path) = self.blob_path(key) else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_range(
        &self,
        key: &ContentKey,
        offset: u64,
        len: u64,
    ) -> io::Result<Option<Vec<u8>>> {
        let Some(path) = self.blob_path(key) else {
            return Ok(None);
        };
        let Some(mut file) = open(&path).await? else {
            return Ok(None);
        };
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        loop {
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_always_misses() {
        let store = NullLocalStore;
        let key = ContentKey::parse("sha256:aaaa").unwrap();
        assert_eq!(store.size(&key).await.unwrap(), None);
        assert_eq!(store.read_range(&key, 0, 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dir_store_reads_blob_range() {
        let dir = tempfile::tempdir().unwrap();
        let blob_dir = dir.path().join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blob_dir).await.unwrap();
        tokio::fs::write(blob_dir.join("abcd"), b"hello world")
            .await
            .unwrap();

        let store = DirLocalStore::new(dir.path());
        let key = ContentKey::parse("sha256:abcd").unwrap();
        assert_eq!(store.size(&key).await.unwrap(), Some(11));
        let bytes = store.read_range(&key, 6, 5).await.unwrap().unwrap();
        assert_eq!(bytes, b"world");
    }

    #[tokio::test]
    async fn dir_store_missing_blob_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirLocalStore::new(dir.path());
        let key = ContentKey::parse("sha256:missing").unwrap();
        assert_eq!(store.size(&key).await.unwrap(), None);
    }
}
