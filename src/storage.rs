use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Raw-blob stash for aggregated session content. A concrete S3/GCS client
/// is out of scope; this seam is real and used by the Orchestrator's
/// compensation logic (upload, then delete-on-rollback).
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `key`, returning a location string suitable
    /// for later reference or logging.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
    /// Idempotent: deleting an already-gone key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed implementation, the local stand-in for an object
/// store, grounded in the teacher's `fs_utils` helpers.
pub struct FilesystemObjectStorage {
    root: PathBuf,
}

impl FilesystemObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStorage for FilesystemObjectStorage {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn arc_filesystem_storage(root: impl Into<PathBuf>) -> Arc<dyn ObjectStorage> {
    Arc::new(FilesystemObjectStorage::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_delete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemObjectStorage::new(dir.path());

        let location = storage.put("session-1/content.txt", b"aggregated text").await.unwrap();
        assert!(std::path::Path::new(&location).exists());

        storage.delete("session-1/content.txt").await.unwrap();
        assert!(!std::path::Path::new(&location).exists());
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemObjectStorage::new(dir.path());
        storage.delete("never-existed.txt").await.unwrap();
    }
}
