//! Store registry for resolving backends from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::DurableStore;
use offsync_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn DurableStore>> + Send + Sync>;

/// Registry for durable store factories.
///
/// Backends are registered by name and built from a JSON configuration
/// object such as `{"kind": "sqlite", "path": "/tmp/app.db"}`.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a store by name.
    pub fn resolve(&self, name: &str, config: &Value) -> Result<Arc<dyn DurableStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Build a store from a config object carrying its own `kind`.
    pub fn resolve_config(&self, config: &Value) -> Result<Arc<dyn DurableStore>> {
        let kind = config
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidInput("Store config requires 'kind'".to_string()))?;
        self.resolve(kind, config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in `memory` and `sqlite` stores.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    // Without a path the database lives in the user's data directory.
    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|config| {
            let path = match config.get("path").and_then(Value::as_str) {
                Some(path) => path.into(),
                None => crate::sqlite::SqliteStore::default_path()?,
            };
            Ok(Arc::new(crate::sqlite::SqliteStore::open(path)?))
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let store = registry.resolve("test", &Value::Null).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = create_default_registry();
        assert!(registry.resolve("gdrive", &Value::Null).is_err());
        assert!(registry.resolve_config(&json!({})).is_err());
    }

    #[test]
    fn test_default_registry_builds_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let registry = create_default_registry();

        assert!(registry.has_store("memory"));
        let store = registry
            .resolve_config(&json!({ "kind": "sqlite", "path": path }))
            .unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(path.exists());
    }
}
