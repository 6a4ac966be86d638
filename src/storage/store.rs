//! Key-value store backends
//!
//! The ledger only needs get, put and key enumeration. `SledStore` persists to
//! disk; `MemoryStore` backs tests and throwaway nodes.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Database error: {0}")]
    Backend(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Minimal key-value interface used by the chain store
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Block until written values are durable
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Store backed by a sled database
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create a database in `path`
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl Store for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.db
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                String::from_utf8(key.to_vec())
                    .map_err(|_| StorageError::InvalidData("non utf-8 key".to_string()))
            })
            .collect()
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StorageError {
    StorageError::InvalidData("memory store lock poisoned".to_string())
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn Store) {
        assert_eq!(store.get("missing").unwrap(), None);
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.put("a", b"3").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"3".to_vec()));

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store() {
        let dir = tempdir().unwrap();
        exercise(&SledStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_sled_store_on_disk() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(&dir.path().join("db")).unwrap();
        store.put("key", b"value").unwrap();
        store.flush().unwrap();
        assert_eq!(store.get("key").unwrap(), Some(b"value".to_vec()));
        assert!(dir.path().join("db").exists());
    }
}
