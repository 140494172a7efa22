//! The engine: owns the shared store, caches, queues and gateway.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use offsync_cache::{CacheFault, CacheManager};
use offsync_common::{CollectionName, Error, Result};
use offsync_gateway::{HttpGateway, NetworkGateway};
use offsync_storage::{create_default_registry, DurableStore};

use crate::config::{DataStoreConfig, EngineConfig};
use crate::datastore::DataStore;
use crate::operation::OperationContext;
use crate::queue::PendingQueue;

/// Registry of per-collection caches and pending queues.
///
/// Data stores handed out for the same collection share one cache and one
/// queue, so their writes and pushes stay ordered. Everything lives as
/// long as the engine.
pub struct SyncEngine {
    store: Arc<dyn DurableStore>,
    gateway: Arc<dyn NetworkGateway>,
    caches: CacheManager,
    queues: Mutex<HashMap<CollectionName, Arc<PendingQueue>>>,
    defaults: DataStoreConfig,
    collections: HashMap<String, DataStoreConfig>,
}

impl SyncEngine {
    /// Create an engine over `store`, talking to `gateway`.
    pub fn new(store: Arc<dyn DurableStore>, gateway: Arc<dyn NetworkGateway>) -> Self {
        Self {
            caches: CacheManager::new(store.clone()),
            store,
            gateway,
            queues: Mutex::new(HashMap::new()),
            defaults: DataStoreConfig::default(),
            collections: HashMap::new(),
        }
    }

    /// Settings for collections without their own entry.
    pub fn with_defaults(mut self, defaults: DataStoreConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Settings for one collection.
    pub fn with_collection_config(
        mut self,
        collection: impl Into<String>,
        config: DataStoreConfig,
    ) -> Self {
        self.collections.insert(collection.into(), config);
        self
    }

    /// Build an engine from a config file's contents.
    ///
    /// # Errors
    /// - The store kind is unknown or the store cannot be opened
    /// - No gateway is configured, or its base URL is invalid
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let store = create_default_registry().resolve_config(&config.store)?;
        let gateway_config = config
            .gateway
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("No gateway configured".to_string()))?;
        let gateway = Arc::new(HttpGateway::new(gateway_config)?);
        info!(
            "Engine using {} store and {}",
            store.name(),
            gateway_config.base_url
        );

        Ok(Self {
            collections: config.collections.clone(),
            ..Self::new(store, gateway).with_defaults(config.defaults.clone())
        })
    }

    /// The data store of `collection`, with its configured settings.
    pub async fn data_store(&self, collection: &str) -> Result<DataStore> {
        let config = self
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        self.data_store_with(collection, config).await
    }

    /// The data store of `collection`, with explicit settings.
    pub async fn data_store_with(
        &self,
        collection: &str,
        config: DataStoreConfig,
    ) -> Result<DataStore> {
        let collection = CollectionName::new(collection)?;
        let queue = self.queue(&collection).await?;
        let cache = self.caches.cache(&collection);
        Ok(DataStore::new(OperationContext::new(
            cache,
            queue,
            self.gateway.clone(),
            config,
        )))
    }

    /// Clear every collection the engine has opened or has settings for:
    /// cached records, cached query results and queued writes.
    ///
    /// Returns the number of queued writes dropped.
    pub async fn clear_cache(&self) -> Result<usize> {
        let mut names: BTreeSet<CollectionName> = self.caches.collections().into_iter().collect();
        names.extend(self.queues.lock().await.keys().cloned());
        names.extend(
            self.collections
                .keys()
                .filter_map(|name| CollectionName::new(name.as_str()).ok()),
        );

        let mut dropped = 0;
        for name in &names {
            let store = self.data_store(name.as_str()).await?;
            dropped += store.clear_cache().value().await?;
        }
        info!("Cleared {} collections, {} pending operations", names.len(), dropped);
        Ok(dropped)
    }

    /// Receive cache faults; each corrupt collection is reported once.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<CacheFault> {
        self.caches.subscribe_faults()
    }

    /// The durable store backing caches and queues.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    async fn queue(&self, collection: &CollectionName) -> Result<Arc<PendingQueue>> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(collection) {
            return Ok(queue.clone());
        }
        let queue = Arc::new(PendingQueue::open(collection.clone(), self.store.clone()).await?);
        queues.insert(collection.clone(), queue.clone());
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_gateway::MemoryGateway;
    use offsync_storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> SyncEngine {
        SyncEngine::new(Arc::new(MemoryStore::new()), Arc::new(MemoryGateway::new()))
    }

    #[tokio::test]
    async fn test_collection_config_overrides_defaults() {
        let engine = engine()
            .with_defaults(DataStoreConfig::default().with_ttl(Duration::from_secs(60)))
            .with_collection_config("books", DataStoreConfig::default().with_delta_set(true));

        let books = engine.data_store("books").await.unwrap();
        let films = engine.data_store("films").await.unwrap();
        assert!(books.config().delta_set);
        assert_eq!(books.config().ttl, 0);
        assert_eq!(films.config().ttl, 60);
    }

    #[tokio::test]
    async fn test_stores_share_queue() {
        let engine = engine();
        let a = engine.data_store("books").await.unwrap();
        let b = engine.data_store("books").await.unwrap();

        a.save(
            offsync_common::Record::new().field("title", "Dune"),
            crate::WritePolicy::ForceLocal,
        )
        .value()
        .await
        .unwrap();
        assert_eq!(b.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_covers_every_collection() {
        let engine = engine();
        let books = engine.data_store("books").await.unwrap();
        let films = engine.data_store("films").await.unwrap();
        for store in [&books, &films] {
            store
                .save(
                    offsync_common::Record::new().field("title", "draft"),
                    crate::WritePolicy::ForceLocal,
                )
                .value()
                .await
                .unwrap();
        }

        assert_eq!(engine.clear_cache().await.unwrap(), 2);
        for store in [&books, &films] {
            assert_eq!(store.pending_count().await.unwrap(), 0);
            let cached = store
                .find(offsync_common::Query::all(), crate::ReadPolicy::LocalOnly)
                .value()
                .await
                .unwrap();
            assert!(cached.is_empty());
        }
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        assert!(engine().data_store("").await.is_err());
    }

    #[test]
    fn test_from_config_requires_gateway() {
        let config = EngineConfig::default();
        assert!(SyncEngine::from_config(&config).is_err());

        let config = EngineConfig {
            gateway: Some(offsync_gateway::HttpGatewayConfig::new("https://api.example.com/")),
            store: json!({ "kind": "memory" }),
            ..EngineConfig::default()
        };
        let engine = SyncEngine::from_config(&config).unwrap();
        assert_eq!(engine.store().name(), "memory");
    }
}
