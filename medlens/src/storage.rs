use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::{LensError, Result},
    identity::DocumentIdentity,
};

/// Key under which the history collection is persisted.
pub const HISTORY_KEY: &str = "medlens.history";
/// Prefix of the per-document keys holding uploaded originals.
pub const SOURCE_KEY_PREFIX: &str = "medlens.source.";
/// Key under which user settings are persisted.
pub const SETTINGS_KEY: &str = "medlens.settings";

pub fn source_key(document: &DocumentIdentity) -> String {
    format!("{SOURCE_KEY_PREFIX}{document}")
}

/// Durable string-keyed blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn write(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory implementation of BlobStore
///
/// An optional quota (in bytes, summed over all values) makes it behave like a
/// capacity-bounded browser store: writes that would exceed it are rejected.
pub struct InMemoryBlobStore {
    blobs: Arc<DashMap<String, String>>,
    quota: Option<usize>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(DashMap::new()),
            quota: None,
        }
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            blobs: Arc::new(DashMap::new()),
            quota: Some(quota),
        }
    }

    fn used_without(&self, key: &str) -> usize {
        self.blobs
            .iter()
            .filter(|entry| entry.key() != key)
            .map(|entry| entry.value().len())
            .sum()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.get(key).map(|entry| entry.value().clone()))
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        if let Some(quota) = self.quota {
            let needed = self.used_without(key) + value.len();
            if needed > quota {
                return Err(LensError::PersistenceFailure(format!(
                    "quota exceeded: {needed} of {quota} bytes"
                )));
            }
        }
        self.blobs.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// File-backed implementation of BlobStore, one file per key.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            LensError::PersistenceFailure(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
        && !key.contains("..");
    if valid {
        Ok(())
    } else {
        Err(LensError::PersistenceFailure(format!("invalid store key {key:?}")))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LensError::PersistenceFailure(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, value.as_bytes()).await.map_err(|e| {
            LensError::PersistenceFailure(format!("cannot write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            LensError::PersistenceFailure(format!("cannot replace {}: {e}", path.display()))
        })?;

        debug!(key = %key, bytes = value.len(), "Blob written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LensError::PersistenceFailure(format!(
                "cannot remove {}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_read_write_remove() {
        let store = InMemoryBlobStore::new();
        assert_eq!(store.read("k").await.unwrap(), None);

        store.write("k", "v".to_string()).await.unwrap();
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("v"));

        store.remove("k").await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn quota_counts_other_keys_and_allows_overwrite() {
        let store = InMemoryBlobStore::with_quota(10);
        store.write("a", "12345".to_string()).await.unwrap();
        store.write("b", "12345".to_string()).await.unwrap();

        // replacing a value only counts its new size
        store.write("b", "1234".to_string()).await.unwrap();

        let err = store.write("c", "12".to_string()).await.unwrap_err();
        assert!(matches!(err, LensError::PersistenceFailure(_)));
        assert_eq!(store.read("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("medlens-store-{}", uuid::Uuid::new_v4()));
        let store = FileBlobStore::open(&dir).await.unwrap();
        assert_eq!(store.dir(), dir.as_path());

        assert_eq!(store.read(HISTORY_KEY).await.unwrap(), None);
        store.write(HISTORY_KEY, "[]".to_string()).await.unwrap();
        assert_eq!(store.read(HISTORY_KEY).await.unwrap().as_deref(), Some("[]"));

        store.remove(HISTORY_KEY).await.unwrap();
        store.remove(HISTORY_KEY).await.unwrap();
        assert_eq!(store.read(HISTORY_KEY).await.unwrap(), None);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn file_store_rejects_traversal_keys() {
        let dir = std::env::temp_dir().join(format!("medlens-store-{}", uuid::Uuid::new_v4()));
        let store = FileBlobStore::open(&dir).await.unwrap();

        for key in ["../escape", "a/b", "", ".hidden"] {
            assert!(store.write(key, "x".to_string()).await.is_err(), "{key:?}");
        }
        let source = source_key(&crate::identity::identity_of(b"scan"));
        store.write(&source, "{}".to_string()).await.unwrap();
        assert!(store.dir().join(format!("{source}.json")).exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
