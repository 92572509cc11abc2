//! Opaque key→bytes persistence for serialized session state and the
//! biometry blob.
//!
//! The default production implementation writes into the platform
//! keychain; the core is agnostic and only requires per-key atomicity
//! (a `load` never observes a torn write). A failed save is reported as
//! a non-fatal warning by the facade: the in-memory counter stays
//! authoritative for the next signature, and a loss across restarts is
//! detected by the server as counter skew.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

/// Failure of the persistence collaborator.
#[derive(Debug, Error)]
#[error("store_error: {0}")]
pub struct StoreError(pub String);

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque byte storage keyed by a string, atomic per key.
pub trait StateStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the platform store rejects the write.
    fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;

    /// Loads the bytes stored under `key`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the platform store cannot be read.
    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Removes the value stored under `key`; removing an absent key is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the platform store rejects the
    /// removal.
    fn remove(&self, key: &str) -> StoreResult<()>;
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        (**self).save(key, bytes)
    }

    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).load(key)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        (**self).remove(key)
    }
}

/// In-memory state store backed by a `HashMap`.
///
/// Thread-safe; intended for tests and for hosts without durable
/// storage.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Returns `true` when nothing is stored.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|e| StoreError(format!("lock poisoned: {e}")))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .map_err(|e| StoreError(format!("lock poisoned: {e}")))?
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|e| StoreError(format!("lock poisoned: {e}")))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_remove() {
        let store = MemoryStateStore::new();
        assert!(store.is_empty());
        assert!(store.load("instance").unwrap().is_none());

        store.save("instance", b"state").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("instance").unwrap(), Some(b"state".to_vec()));

        store.save("instance", b"updated").unwrap();
        assert_eq!(store.load("instance").unwrap(), Some(b"updated".to_vec()));

        store.remove("instance").unwrap();
        assert!(store.load("instance").unwrap().is_none());
    }

    #[test]
    fn test_remove_absent_key_is_ok() {
        let store = MemoryStateStore::new();
        store.remove("missing").unwrap();
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryStateStore::new();
        store.save("a", b"1").unwrap();
        store.save("b", b"2").unwrap();
        store.remove("a").unwrap();
        assert_eq!(store.load("b").unwrap(), Some(b"2".to_vec()));
    }
}
