use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Extension of every stored blob; all blobs are normalized JPEG
pub const BLOB_EXTENSION: &str = "jpg";

/// Errors from the blob backend
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("Blob '{0}' not found")]
    NotFound(String),

    #[error("Invalid blob name '{0}'")]
    InvalidName(String),

    #[error("Blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a unique blob name: `{unix-millis}-{random hex}.jpg`.
///
/// The timestamp keeps names sortable by creation time; the 128-bit
/// random suffix makes collisions statistically negligible.
pub fn generate_blob_name() -> String {
    format!(
        "{}-{}.{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        BLOB_EXTENSION
    )
}

/// Check a name against the exact generated shape `{digits}-{alnum}.jpg`.
///
/// Anything else is refused before touching storage, so path traversal
/// sequences and arbitrary filesystem paths never reach the backend.
pub fn is_valid_blob_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".jpg") else {
        return false;
    };
    let Some((timestamp, suffix)) = stem.split_once('-') else {
        return false;
    };
    !timestamp.is_empty()
        && timestamp.bytes().all(|b| b.is_ascii_digit())
        && !suffix.is_empty()
        && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Write-once blob storage addressed by generated name.
///
/// Names are request-scoped and unique, so writes from different
/// requests never contend on the same key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write bytes under a freshly generated name and return the name.
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobStoreError>;

    /// Read a blob back by name.
    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// Delete a blob. Deleting a missing name is not an error, which
    /// keeps rollback idempotent.
    async fn delete(&self, name: &str) -> Result<(), BlobStoreError>;
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create the store, creating the root directory if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        info!(root = %root.display(), "Blob store initialized");

        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, BlobStoreError> {
        if !is_valid_blob_name(name) {
            return Err(BlobStoreError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobStoreError> {
        let name = generate_blob_name();
        let path = self.root.join(&name);

        // Write to a temp file, then rename: the blob becomes visible
        // under its final name only once fully written.
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(name = %name, size_bytes = bytes.len(), "Blob written");

        Ok(name)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for(name)?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(name)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(name = %name, "Blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory blob store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobStoreError> {
        let name = generate_blob_name();
        self.blobs
            .write()
            .unwrap()
            .insert(name.clone(), bytes.to_vec());
        Ok(name)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.blobs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), BlobStoreError> {
        self.blobs.write().unwrap().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_name_shape() {
        let name = generate_blob_name();

        assert!(is_valid_blob_name(&name), "generated name: {name}");
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn test_valid_blob_names() {
        assert!(is_valid_blob_name("1700000000000-abc123.jpg"));
        assert!(is_valid_blob_name("1-a.jpg"));
    }

    #[test]
    fn test_invalid_blob_names() {
        assert!(!is_valid_blob_name(""));
        assert!(!is_valid_blob_name("photo.jpg"));
        assert!(!is_valid_blob_name("1700000000000-abc.png"));
        assert!(!is_valid_blob_name("1700000000000-abc"));
        assert!(!is_valid_blob_name("1700000000000-.jpg"));
        assert!(!is_valid_blob_name("-abc.jpg"));
        assert!(!is_valid_blob_name("1700-ab-cd.jpg"));
        assert!(!is_valid_blob_name("../etc/passwd"));
        assert!(!is_valid_blob_name("..\\secret.jpg"));
        assert!(!is_valid_blob_name("a/1700000000000-abc.jpg"));
        assert!(!is_valid_blob_name("1700000000000-a..b.jpg"));
    }

    #[tokio::test]
    async fn test_fs_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let name = store.put(b"jpeg bytes").await.unwrap();
        assert!(is_valid_blob_name(&name));

        let bytes = store.get(&name).await.unwrap();
        assert_eq!(bytes, b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_fs_get_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let result = store.get("1700000000000-deadbeef.jpg").await;
        assert!(matches!(result, Err(BlobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fs_get_rejects_invalid_name() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let result = store.get("../outside.jpg").await;
        assert!(matches!(result, Err(BlobStoreError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_fs_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        let name = store.put(b"bytes").await.unwrap();
        store.delete(&name).await.unwrap();
        // Second delete of the same name succeeds
        store.delete(&name).await.unwrap();

        assert!(matches!(
            store.get(&name).await,
            Err(BlobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_leaves_no_temp_file_behind() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();

        store.put(b"bytes").await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(name.ends_with(".jpg"), "unexpected file: {name}");
        }
    }

    #[tokio::test]
    async fn test_memory_roundtrip_and_delete() {
        let store = MemoryBlobStore::new();

        let name = store.put(b"bytes").await.unwrap();
        assert_eq!(store.get(&name).await.unwrap(), b"bytes");
        assert_eq!(store.len(), 1);

        store.delete(&name).await.unwrap();
        store.delete(&name).await.unwrap();
        assert!(store.is_empty());
    }
}
