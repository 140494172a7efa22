//! Registry of per-collection caches.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::cache::Cache;
use offsync_common::CollectionName;
use offsync_storage::DurableStore;

/// Capacity of the fault channel. Faults are rare: at most one per collection.
const FAULT_CHANNEL_CAPACITY: usize = 64;

/// A collection cache that became unusable.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheFault {
    /// The affected collection.
    pub collection: CollectionName,
    /// Why the cache was disabled.
    pub reason: String,
}

/// Hands out one [`Cache`] per collection over a shared store.
///
/// Caches live as long as the manager; asking twice for the same collection
/// returns the same instance, so both callers share its lock.
pub struct CacheManager {
    store: Arc<dyn DurableStore>,
    caches: Mutex<HashMap<CollectionName, Arc<Cache>>>,
    faults: broadcast::Sender<CacheFault>,
}

impl CacheManager {
    /// Create a manager over `store`.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self {
            store,
            caches: Mutex::new(HashMap::new()),
            faults,
        }
    }

    /// Get or create the cache of a collection.
    pub fn cache(&self, collection: &CollectionName) -> Arc<Cache> {
        self.caches
            .lock()
            .entry(collection.clone())
            .or_insert_with(|| {
                Arc::new(Cache::new(
                    collection.clone(),
                    self.store.clone(),
                    self.faults.clone(),
                ))
            })
            .clone()
    }

    /// Receive storage faults. Each corrupt collection is reported once.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<CacheFault> {
        self.faults.subscribe()
    }

    /// Collections with an open cache.
    pub fn collections(&self) -> Vec<CollectionName> {
        self.caches.lock().keys().cloned().collect()
    }
}
