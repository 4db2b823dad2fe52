use std::fmt;
use std::path::{Path, PathBuf};

/// Size of one cache block. All on-disk offsets are multiples of this.
///
/// 1 MiB, as recommended by the caching design: large enough to amortize
/// per-block overhead, small enough that a single missed block doesn't
/// stall a reader for long.
pub const BLOCK_SIZE: u64 = 1 << 20;

const ALLOWED_ALGORITHMS: &[&str] = &["sha256", "sha512"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("content key has no algorithm:hex separator")]
    MissingSeparator,
    #[error("content key algorithm {0:?} is not supported")]
    UnsupportedAlgorithm(String),
    #[error("content key hex part is empty")]
    EmptyHex,
    #[error("content key contains a path-traversal character")]
    PathTraversal,
}

/// A content-addressed key: `<algorithm>:<hex>`.
///
/// Rejects `.` and `/` up front the same way a disk-backed cache key must,
/// since the hex part is later used as a path component.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn parse(s: impl Into<String>) -> Result<Self, ParseError> {
        let s = s.into();
        if s.contains('.') || s.contains('/') {
            return Err(ParseError::PathTraversal);
        }
        let (algo, hex) = s.split_once(':').ok_or(ParseError::MissingSeparator)?;
        if !ALLOWED_ALGORITHMS.contains(&algo) {
            return Err(ParseError::UnsupportedAlgorithm(algo.to_string()));
        }
        if hex.is_empty() {
            return Err(ParseError::EmptyHex);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory-safe form of this key, e.g. `sha256:abcd` -> `sha256/abcd`.
    fn sanitized(&self) -> String {
        self.0.replacen(':', "/", 1)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one block-aligned slice of a `ContentKey`'s content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub key: ContentKey,
    pub offset: u64,
}

impl BlockId {
    /// `offset` must already be block-aligned; callers derive it via
    /// `floor(pos / BLOCK_SIZE) * BLOCK_SIZE`.
    pub fn new(key: ContentKey, offset: u64) -> Self {
        Self { key, offset }
    }

    pub fn align(pos: u64) -> u64 {
        (pos / BLOCK_SIZE) * BLOCK_SIZE
    }

    /// Composite key used inside the in-memory index: `"<content-key>|<offset>"`.
    pub fn index_key(&self) -> String {
        format!("{}|{}", self.key.as_str(), self.offset)
    }

    /// The block-scoped content key advertised into the DHT once this block
    /// is filled: `<alg>:<hex>_<offset>-<end>`.
    pub fn advertised_key(&self, len: u64) -> String {
        let end = self.offset + len.saturating_sub(1);
        format!("{}_{}-{}", self.key.as_str(), self.offset, end)
    }

    pub fn disk_path(&self, root: &Path) -> PathBuf {
        root.join(self.key.sanitized()).join(self.offset.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let k = ContentKey::parse("sha256:abcd1234").unwrap();
        assert_eq!(k.as_str(), "sha256:abcd1234");
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert_eq!(
            ContentKey::parse("md5:abcd").unwrap_err(),
            ParseError::UnsupportedAlgorithm("md5".to_string())
        );
    }

    #[test]
    fn rejects_path_traversal() {
        assert_eq!(
            ContentKey::parse("sha256:../../etc").unwrap_err(),
            ParseError::PathTraversal
        );
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            ContentKey::parse("sha256abcd").unwrap_err(),
            ParseError::MissingSeparator
        );
    }

    #[test]
    fn block_key_roundtrip() {
        let key = ContentKey::parse("sha256:abcd").unwrap();
        let block = BlockId::new(key, BLOCK_SIZE);
        assert_eq!(block.index_key(), format!("sha256:abcd|{}", BLOCK_SIZE));
        assert_eq!(
            block.advertised_key(100),
            format!("sha256:abcd_{}-{}", BLOCK_SIZE, BLOCK_SIZE + 99)
        );
    }

    #[test]
    fn align_rounds_down() {
        assert_eq!(BlockId::align(BLOCK_SIZE + 5), BLOCK_SIZE);
        assert_eq!(BlockId::align(BLOCK_SIZE - 1), 0);
    }
}
