//! Key-value mirror storage.
//!
//! The console mirrors a handful of small JSON documents (last search, active
//! fields, favorite module) so a reloaded tab can pick up where it left off.
//! Stores are synchronous and string-valued.

pub mod config;
pub mod factory;
pub mod file;
pub mod in_memory;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors raised by a [`KeyValueStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The underlying medium failed (I/O, poisoned lock).
    Io(String),
    /// A stored value could not be encoded or decoded.
    Encoding(String),
    /// The key cannot be represented by this store.
    InvalidKey(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(msg) => write!(f, "storage i/o error: {}", msg),
            StorageError::Encoding(msg) => write!(f, "storage encoding error: {}", msg),
            StorageError::InvalidKey(key) => write!(f, "invalid storage key: {:?}", key),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A string-keyed, string-valued store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn put(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StorageResult<()>;
}

/// JSON convenience methods available on every store.
pub trait KeyValueStoreExt: KeyValueStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let raw = serde_json::to_string(value)?;
        self.put(key, &raw)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}
