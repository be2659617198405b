//! Directory-backed durable store.
//!
//! Layout:
//!
//! ```text
//! <root>/values/<key>     keyed values
//! <root>/blobs/<name>     named blobs
//! ```
//!
//! Every write goes to a uniquely named temp file in the same directory and
//! is then renamed over the target, so a crash leaves either the old or the
//! new content, never a torn file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::store::{validate_key, SharedStore};

const VALUES_DIR: &str = "values";
const BLOBS_DIR: &str = "blobs";

/// Durable store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        for dir in [VALUES_DIR, BLOBS_DIR] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| PersistenceError::io(&path, e))?;
        }
        Ok(Self { root })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        validate_key(key)?;
        Ok(self.root.join(VALUES_DIR).join(key))
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, PersistenceError> {
        validate_key(name)?;
        Ok(self.root.join(BLOBS_DIR).join(name))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("value");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        return Err(PersistenceError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(PersistenceError::io(path, e));
    }
    Ok(())
}

#[async_trait]
impl SharedStore for FileStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.value_path(key)?).await
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError> {
        write_atomic(&self.value_path(key)?, &value).await
    }

    async fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
        let path = self.value_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        write_atomic(&self.blob_path(name)?, bytes).await
    }

    async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.blob_path(name)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedStoreExt;

    #[tokio::test]
    async fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("state")).await.unwrap();

        assert!(store.root().join("values").is_dir());
        assert!(store.root().join("blobs").is_dir());
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.set("sequence.next", &42u64).await.unwrap();
            store.write_blob("pending_operations", b"queue").await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get::<u64>("sequence.next").await.unwrap(), Some(42));
        assert_eq!(
            reopened.read_blob("pending_operations").await.unwrap(),
            Some(b"queue".to_vec())
        );
    }

    #[tokio::test]
    async fn missing_entries_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        assert!(store.get_raw("absent").await.unwrap().is_none());
        assert!(store.read_blob("absent").await.unwrap().is_none());
        assert!(!store.remove("absent").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.set("k", &1u8).await.unwrap();
        store.set("k", &2u8).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("values"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("k")]);
        assert_eq!(store.get::<u8>("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let result = store.set_raw("../outside", vec![1]).await;
        assert!(matches!(result, Err(PersistenceError::InvalidKey(_))));
        let result = store.write_blob("a/b", b"x").await;
        assert!(matches!(result, Err(PersistenceError::InvalidKey(_))));
    }
}
