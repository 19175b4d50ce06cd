//! Keyed state store: process-wide client state behind an injected trait.
//!
//! Values are opaque JSON. Keys start empty; [`KeyValueStore::ensure`]
//! seeds a default on first use. Nothing is torn down before process exit.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Key under which the client shell keeps its pool-coin list.
pub const POOL_COINS_KEY: &str = "poolCoins";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("stored value is not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store key must not be empty")]
    EmptyKey,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Return the stored value, writing `default` first if the key is absent.
    fn ensure(&self, key: &str, default: Value) -> Result<Value, StoreError> {
        match self.get(key)? {
            Some(v) => Ok(v),
            None => {
                self.set(key, default.clone())?;
                Ok(default)
            }
        }
    }
}

pub(crate) fn check_key(key: &str) -> Result<(), StoreError> {
    if key.trim().is_empty() {
        Err(StoreError::EmptyKey)
    } else {
        Ok(())
    }
}

/// Volatile store; contents die with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        check_key(key)?;
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        check_key(key)?;
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        check_key(key)?;
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(map.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
