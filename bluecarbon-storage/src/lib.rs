//! Persistent key-value storage for the Blue Carbon sync layer.
//!
//! The sync core only needs a namespaced `key -> string` store that survives
//! process restarts. Two implementations are provided:
//!
//! - [`SqliteStore`]: a single SQLite table, used by the agent and the mobile
//!   shell for the offline outbound queue and local entity caches
//! - [`MemoryStore`]: a process-local map, used in tests and for ephemeral
//!   sessions
//!
//! # Atomicity
//!
//! Single `set`/`delete` calls are atomic. [`KvStore::apply_batch`] applies a
//! list of writes to one namespace all-or-nothing, which is what the outbound
//! queue uses to keep an item and its index consistent across a crash.

mod error;
mod memory;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Insert or overwrite a key.
    Set { key: String, value: String },
    /// Remove a key. Removing a missing key is not an error.
    Delete { key: String },
}

impl KvOp {
    /// Convenience constructor for [`KvOp::Set`].
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for [`KvOp::Delete`].
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Namespaced, durable key-value store.
///
/// Implementations must be safe to share between tasks. Calls are
/// synchronous and expected to be short (local disk or memory).
pub trait KvStore: Send + Sync {
    /// Reads a key.
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<String>>;

    /// Inserts or overwrites a key.
    fn set(&self, namespace: &str, key: &str, value: &str) -> StorageResult<()>;

    /// Removes a key. Returns whether the key existed.
    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// Lists all keys in a namespace in ascending lexical order.
    fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Applies several writes to one namespace atomically.
    fn apply_batch(&self, namespace: &str, ops: &[KvOp]) -> StorageResult<()>;
}
