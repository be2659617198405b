//! Store trait, typed access, and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PersistenceError;

/// Small persistent key-value and blob store visible to both the coordinator
/// and the business layer.
///
/// Values are opaque bytes at this level; [`SharedStoreExt`] adds typed access.
/// The store takes no part in conflict resolution and only holds whatever the
/// coordinator decided is current.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the raw bytes stored under `key`.
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store raw bytes under `key`, replacing any previous value.
    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError>;

    /// Remove `key`. Returns `Ok(true)` if it existed.
    async fn remove(&self, key: &str) -> Result<bool, PersistenceError>;

    /// Write a named blob, replacing any previous content.
    async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Read a named blob.
    async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// Typed access on top of any [`SharedStore`], JSON-encoded.
#[async_trait]
pub trait SharedStoreExt: SharedStore {
    /// Read and decode the value under `key`.
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        match self.get_raw(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| PersistenceError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Encode and store `value` under `key`.
    async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(value).map_err(|source| PersistenceError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, bytes).await
    }
}

impl<S: SharedStore + ?Sized> SharedStoreExt for S {}

/// Check that a key or blob name is safe to use as a file name.
///
/// Allowed: non-empty, at most 128 chars of `[A-Za-z0-9._-]`, not starting
/// with a dot.
pub fn validate_key(key: &str) -> Result<(), PersistenceError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidKey(key.to_string()))
    }
}

/// In-memory store for testing.
///
/// Thread-safe, cheap to clone (clones share state). Not persistent - all
/// data is lost when the last clone is dropped.
#[derive(Default, Clone)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keyed values.
    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    /// Check if there are no keyed values.
    pub fn is_empty(&self) -> bool {
        self.values.lock().unwrap().is_empty()
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        validate_key(key)?;
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError> {
        validate_key(key)?;
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
        validate_key(key)?;
        Ok(self.values.lock().unwrap().remove(key).is_some())
    }

    async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        validate_key(name)?;
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        validate_key(name)?;
        Ok(self.blobs.lock().unwrap().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        id: String,
        index: u32,
    }

    #[tokio::test]
    async fn typed_set_get() {
        let store = MemoryStore::new();
        let value = Snapshot {
            id: "w1".into(),
            index: 3,
        };

        store.set("snapshot.session", &value).await.unwrap();
        let restored: Option<Snapshot> = store.get("snapshot.session").await.unwrap();

        assert_eq!(restored, Some(value));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = MemoryStore::new();
        let value: Option<Snapshot> = store.get("nothing").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn set_overwrites() {
        let store = MemoryStore::new();
        store.set("n", &1u32).await.unwrap();
        store.set("n", &2u32).await.unwrap();
        assert_eq!(store.get::<u32>("n").await.unwrap(), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn wrong_type_is_serialization_error() {
        let store = MemoryStore::new();
        store.set("n", &"text").await.unwrap();
        let result = store.get::<u32>("n").await;
        assert!(matches!(result, Err(PersistenceError::Serialization { .. })));
    }

    #[tokio::test]
    async fn blobs_are_separate_from_values() {
        let store = MemoryStore::new();
        store.write_blob("queue", b"\x01\x02").await.unwrap();

        assert_eq!(store.read_blob("queue").await.unwrap(), Some(vec![1, 2]));
        assert!(store.get_raw("queue").await.unwrap().is_none());
        assert!(store.read_blob("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let store = MemoryStore::new();
        store.set("k", &true).await.unwrap();
        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", &1u8).await.unwrap();
        assert_eq!(other.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("snapshot.set.abc-123_x").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key(&"x".repeat(129)).is_err());
    }
}
