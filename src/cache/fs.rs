use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{CacheError, CacheStore, Fingerprint};

/// Filesystem-backed response cache.
///
/// Layout: `<root>/<32 hex chars>.json`, one file per fingerprint. There is no
/// eviction; pruning the directory is left to operators.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    /// Create a cache rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.json", fingerprint.to_hex()))
    }
}

#[async_trait]
impl CacheStore for FsCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(fingerprint);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn put(&self, fingerprint: &Fingerprint, payload: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(fingerprint);
        let root = self.root.clone();
        let payload = payload.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            if path.exists() {
                debug!(path = %path.display(), "cache entry already present");
                return Ok(());
            }
            write_new(&root, &path, &payload)
        })
        .await?
    }
}

/// Write `payload` to `path` through a temp file in `root`. An entry that
/// appeared in the meantime is kept and the write becomes a no-op.
fn write_new(root: &Path, path: &Path, payload: &[u8]) -> Result<(), CacheError> {
    let mut tmp = NamedTempFile::new_in(root)?;
    tmp.write_all(payload)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "lost write race, keeping existing entry");
            Ok(())
        }
        Err(e) => Err(CacheError::Io(e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FINGERPRINT_LEN;
    use pretty_assertions::assert_eq;

    fn make_cache() -> (tempfile::TempDir, FsCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsCache::new(dir.path().join("openai")).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn miss_is_not_an_error() {
        let (_dir, cache) = make_cache();
        let fp = Fingerprint::from_bytes([7; FINGERPRINT_LEN]);
        assert!(cache.get(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get() {
        let (_dir, cache) = make_cache();
        let fp = Fingerprint::from_bytes([9; FINGERPRINT_LEN]);
        cache.put(&fp, br#"{"id":"x"}"#).await.unwrap();
        assert_eq!(cache.get(&fp).await.unwrap(), Some(br#"{"id":"x"}"#.to_vec()));
        assert!(cache.entry_path(&fp).ends_with(format!("{}.json", fp.to_hex())));
    }

    #[tokio::test]
    async fn second_put_keeps_first_payload() {
        let (dir, cache) = make_cache();
        let fp = Fingerprint::from_bytes([3; FINGERPRINT_LEN]);
        cache.put(&fp, b"original").await.unwrap();
        cache.put(&fp, b"replacement").await.unwrap();
        assert_eq!(cache.get(&fp).await.unwrap(), Some(b"original".to_vec()));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("openai"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn write_new_never_replaces_an_entry() {
        let (dir, cache) = make_cache();
        let fp = Fingerprint::from_bytes([5; FINGERPRINT_LEN]);
        let path = cache.entry_path(&fp);
        std::fs::write(&path, b"first").unwrap();

        write_new(cache.root(), &path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"first".to_vec());
        let entries = std::fs::read_dir(dir.path().join("openai")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_agree_on_one_entry() {
        let (_dir, cache) = make_cache();
        let fp = Fingerprint::from_bytes([11; FINGERPRINT_LEN]);

        let writers = (0..16).map(|i| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let payload = format!("{{\"writer\":{}}}", i).into_bytes();
                cache.put(&fp, &payload).await.unwrap();
                cache.get(&fp).await.unwrap().unwrap()
            })
        });
        let seen: Vec<Vec<u8>> = futures::future::try_join_all(writers).await.unwrap();

        let stored = std::fs::read(cache.entry_path(&fp)).unwrap();
        assert!(seen.iter().all(|s| *s == stored));
    }
}
