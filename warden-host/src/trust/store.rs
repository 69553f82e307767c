//! Trust decision storage
//!
//! A trust store maps `codeHash::resourceKey` to an allow/deny boolean.
//! Entries remember their write order; rewriting a key moves it to the end.

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Error type for trust store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access trust store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode trust store: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode trust store: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Trust store is corrupt: {0}")]
    Corrupt(String),

    #[error("Invalid trust key: {0}")]
    InvalidKey(String),

    #[error("Store is read-only")]
    ReadOnly,
}

/// Durable mapping of decision keys to allow/deny
///
/// `init` is lazy and idempotent; every other method may call it implicitly.
/// `flush` persists synchronously; implementations are free to persist
/// asynchronously after each mutation as well.
pub trait TrustStore: Send + Sync {
    /// Load persisted state
    fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<bool>, StoreError>;

    fn set(&self, key: &str, allowed: bool) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All decisions in write order
    fn list(&self) -> Result<Vec<(String, bool)>, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Persist pending writes
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// Ordered decision map
// ============================================================================

/// Decisions ordered by last write
#[derive(Debug, Clone, Default)]
pub(crate) struct DecisionMap {
    entries: HashMap<String, (u64, bool)>,
    seq: u64,
}

impl DecisionMap {
    pub(crate) fn from_entries(entries: Vec<(String, bool)>) -> Self {
        let mut map = Self::default();
        for (key, allowed) in entries {
            map.insert(key, allowed);
        }
        map
    }

    pub(crate) fn get(&self, key: &str) -> Option<bool> {
        self.entries.get(key).map(|(_, allowed)| *allowed)
    }

    pub(crate) fn insert(&mut self, key: String, allowed: bool) {
        self.seq += 1;
        self.entries.insert(key, (self.seq, allowed));
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ordered(&self) -> Vec<(String, bool)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(key, (seq, allowed))| (*seq, key.clone(), *allowed))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries
            .into_iter()
            .map(|(_, key, allowed)| (key, allowed))
            .collect()
    }
}

// ============================================================================
// In-Memory Trust Store
// ============================================================================

/// In-memory trust store for testing or session-only decisions
pub struct MemoryTrustStore {
    data: RwLock<DecisionMap>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(DecisionMap::default()),
        }
    }

    /// Store pre-seeded with decisions
    pub fn with_entries(entries: impl IntoIterator<Item = (String, bool)>) -> Self {
        Self {
            data: RwLock::new(DecisionMap::from_entries(entries.into_iter().collect())),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustStore for MemoryTrustStore {
    fn get(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.data.read().unwrap_or_else(|e| e.into_inner()).get(key))
    }

    fn set(&self, key: &str, allowed: bool) -> Result<(), StoreError> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), allowed);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, bool)>, StoreError> {
        Ok(self.data.read().unwrap_or_else(|e| e.into_inner()).ordered())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.data.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTrustStore")
            .field("count", &self.len())
            .finish()
    }
}

// ============================================================================
// Read-Only Trust Store
// ============================================================================

/// Read-only wrapper for any trust store
///
/// Decisions made while wrapped still apply to the current process through
/// the broker's caches; they are just never persisted.
pub struct ReadOnlyTrustStore<S: TrustStore> {
    inner: S,
}

impl<S: TrustStore> ReadOnlyTrustStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: TrustStore> TrustStore for ReadOnlyTrustStore<S> {
    fn init(&self) -> Result<(), StoreError> {
        self.inner.init()
    }

    fn get(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, _key: &str, _allowed: bool) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn list(&self) -> Result<Vec<(String, bool)>, StoreError> {
        self.inner.list()
    }

    fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}

impl<S: TrustStore + std::fmt::Debug> std::fmt::Debug for ReadOnlyTrustStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyTrustStore")
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryTrustStore::new();

        store.set("h1::fs", true).unwrap();
        assert_eq!(store.get("h1::fs").unwrap(), Some(true));
        assert_eq!(store.get("h1::os").unwrap(), None);

        store.remove("h1::fs").unwrap();
        assert!(store.get("h1::fs").unwrap().is_none());
    }

    #[test]
    fn test_list_is_in_write_order() {
        let store = MemoryTrustStore::new();
        store.set("a", true).unwrap();
        store.set("b", false).unwrap();
        store.set("c", true).unwrap();
        store.set("a", false).unwrap();

        let keys: Vec<_> = store.list().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
        assert_eq!(store.get("a").unwrap(), Some(false));
    }

    #[test]
    fn test_read_only_store() {
        let inner = MemoryTrustStore::with_entries(vec![("h::fs".to_string(), true)]);
        let store = ReadOnlyTrustStore::new(inner);

        assert_eq!(store.get("h::fs").unwrap(), Some(true));
        assert!(matches!(store.set("h::os", true), Err(StoreError::ReadOnly)));
        assert!(matches!(store.remove("h::fs"), Err(StoreError::ReadOnly)));
        assert!(matches!(store.clear(), Err(StoreError::ReadOnly)));
    }
}
