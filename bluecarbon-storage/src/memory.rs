//! In-memory store.

use crate::{KvOp, KvStore, StorageError, StorageResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

type Namespaces = HashMap<String, BTreeMap<String, String>>;

/// A [`KvStore`] held in process memory.
///
/// Clones share the same data, so a test can drop every component that uses
/// the store and rebuild them against a clone to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Namespaces>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a namespace.
    pub fn len(&self, namespace: &str) -> usize {
        self.data
            .lock()
            .map(|d| d.get(namespace).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Whether a namespace holds no keys.
    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut Namespaces) -> T) -> StorageResult<T> {
        let mut guard = self.data.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(f(&mut guard))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<String>> {
        self.with_data(|d| d.get(namespace).and_then(|ns| ns.get(key).cloned()))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> StorageResult<()> {
        self.with_data(|d| {
            d.entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        self.with_data(|d| {
            d.get_mut(namespace)
                .is_some_and(|ns| ns.remove(key).is_some())
        })
    }

    fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        self.with_data(|d| {
            d.get(namespace)
                .map(|ns| ns.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn apply_batch(&self, namespace: &str, ops: &[KvOp]) -> StorageResult<()> {
        // One lock for the whole batch; nothing can observe a partial write.
        self.with_data(|d| {
            let ns = d.entry(namespace.to_string()).or_default();
            for op in ops {
                match op {
                    KvOp::Set { key, value } => {
                        ns.insert(key.clone(), value.clone());
                    }
                    KvOp::Delete { key } => {
                        ns.remove(key);
                    }
                }
            }
        })
    }
}
