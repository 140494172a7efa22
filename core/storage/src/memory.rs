//! In-memory durable store for testing.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::store::{BatchOp, DurableStore};
use offsync_common::{Error, Result};

type Namespace = BTreeMap<String, Vec<u8>>;

/// In-memory durable store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same data, which lets a test
/// "restart" a component by opening it again over a clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    namespaces: Arc<RwLock<HashMap<String, Namespace>>>,
    failing_writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a transient storage error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(Error::Storage("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_write()?;
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.check_write()?;
        Ok(self
            .namespaces
            .write()
            .get_mut(namespace)
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false))
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        self.check_write()?;
        Ok(self
            .namespaces
            .write()
            .remove(namespace)
            .map(|ns| ns.len())
            .unwrap_or(0))
    }

    fn write_batch(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()> {
        self.check_write()?;
        let mut namespaces = self.namespaces.write();
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    ns.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    ns.remove(&key);
                }
            }
        }
        Ok(())
    }
}
