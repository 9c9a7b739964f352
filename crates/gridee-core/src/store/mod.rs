//! Durable key-value storage for session state.
//!
//! This module provides the `KeyValueStore` capability the session manager
//! persists into, plus three implementations:
//! - `MemoryStore`: process-local map, used in tests
//! - `FileStore`: JSON file under the user's data directory
//! - `KeyringStore`: a single OS keychain entry
//!
//! Every store applies a batch of edits atomically, so a reader never sees
//! half of a session write or half of a clear.

pub mod file;
pub mod keyring;
pub mod memory;

use std::collections::HashMap;

use thiserror::Error;

pub use self::file::FileStore;
pub use self::keyring::KeyringStore;
pub use self::memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode stored data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),
}

/// A single change inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Put(String, String),
    Remove(String),
}

impl Edit {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Edit::Put(key.into(), value.into())
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Edit::Remove(key.into())
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read several keys from one consistent snapshot.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError>;

    /// Apply all edits as one unit. Either every edit lands or none does.
    fn commit(&self, edits: Vec<Edit>) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.commit(vec![Edit::put(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.commit(vec![Edit::remove(key)])
    }
}

/// Apply a batch to an in-memory map. Shared by every store implementation.
pub(crate) fn apply_edits(map: &mut HashMap<String, String>, edits: Vec<Edit>) {
    for edit in edits {
        match edit {
            Edit::Put(key, value) => {
                map.insert(key, value);
            }
            Edit::Remove(key) => {
                map.remove(&key);
            }
        }
    }
}

pub(crate) fn select(map: &HashMap<String, String>, keys: &[&str]) -> Vec<Option<String>> {
    keys.iter().map(|k| map.get(*k).cloned()).collect()
}
