//! Durable store trait definition.

use offsync_common::Result;

/// One mutation inside a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace a key.
    Put {
        /// Entry key.
        key: String,
        /// Entry bytes.
        value: Vec<u8>,
    },
    /// Remove a key if present.
    Delete {
        /// Entry key.
        key: String,
    },
}

/// Keyed byte store shared by the cache and the pending-operation queue.
///
/// Keys live in namespaces (for example `records/books`). Implementations
/// must be safe to call from several threads at once.
pub trait DurableStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Read one entry.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace one entry.
    ///
    /// # Postconditions
    /// - A later `get` of the same key returns exactly `value`
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove one entry. Returns whether it existed.
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All entries of a namespace, ordered by key.
    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every entry of a namespace. Returns how many were removed.
    fn clear(&self, namespace: &str) -> Result<usize>;

    /// Apply several mutations to one namespace.
    ///
    /// Backends with transactions apply the batch atomically; the default
    /// applies the operations in order.
    fn write_batch(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()> {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => self.put(namespace, &key, value)?,
                BatchOp::Delete { key } => {
                    self.delete(namespace, &key)?;
                }
            }
        }
        Ok(())
    }
}
