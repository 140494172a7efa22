//! Engine and data store configuration.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use offsync_common::{Error, Result};
use offsync_gateway::HttpGatewayConfig;

use crate::conflict::ConflictStrategy;
use crate::scheduler::SyncMode;

/// Where a read looks for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Ask the backend; never look at the cache.
    NetworkOnly,
    /// Answer from the cache only.
    LocalOnly,
    /// Answer from a fresh cache hit, then refresh from the backend.
    #[default]
    Both,
}

/// Where a write goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Write to the backend, then the cache.
    #[default]
    ForceNetwork,
    /// Write to the cache and queue the write for the next push.
    ForceLocal,
    /// Write locally, then try to replay the write right away.
    LocalThenNetwork,
}

/// Per-collection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    /// Freshness window of cached data, in seconds. 0 means never fresh.
    pub ttl: u64,
    /// Refresh find results incrementally.
    pub delta_set: bool,
    /// Policy used when a read does not name one.
    pub read_policy: ReadPolicy,
    /// Policy used when a write does not name one.
    pub write_policy: WritePolicy,
    /// Maximum number of records replayed concurrently by a push.
    pub push_fan_out: usize,
    /// What a push does with conflicting writes.
    pub conflict_strategy: ConflictStrategy,
    /// When pushes run without being asked.
    pub sync_mode: SyncMode,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            ttl: 0,
            delta_set: false,
            read_policy: ReadPolicy::Both,
            write_policy: WritePolicy::ForceNetwork,
            push_fan_out: 4,
            conflict_strategy: ConflictStrategy::LastWriterWins,
            sync_mode: SyncMode::Manual,
        }
    }
}

impl DataStoreConfig {
    /// Set the freshness window, rounded up to whole seconds.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl
            .as_secs()
            .saturating_add(u64::from(ttl.subsec_nanos() > 0));
        self
    }

    /// Enable or disable delta-set refresh.
    pub fn with_delta_set(mut self, enabled: bool) -> Self {
        self.delta_set = enabled;
        self
    }

    /// Set the default read policy.
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    /// Set the default write policy.
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Set the push fan-out. Zero is treated as one.
    pub fn with_push_fan_out(mut self, fan_out: usize) -> Self {
        self.push_fan_out = fan_out;
        self
    }

    /// Set the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Set the sync mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// The freshness window.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// Configuration of a whole engine, as stored in a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Durable store, resolved through the store registry by its `kind`.
    pub store: Value,
    /// Backend to talk to; `None` runs without a configured backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<HttpGatewayConfig>,
    /// Settings for collections without their own entry.
    pub defaults: DataStoreConfig,
    /// Per-collection settings.
    pub collections: HashMap<String, DataStoreConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: json!({ "kind": "memory" }),
            gateway: None,
            defaults: DataStoreConfig::default(),
            collections: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("Invalid engine config: {}", e)))
    }

    /// Read a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write a config file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Settings for `collection`.
    pub fn datastore_config(&self, collection: &str) -> DataStoreConfig {
        self.collections
            .get(collection)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DataStoreConfig::default();
        assert_eq!(config.read_policy, ReadPolicy::Both);
        assert_eq!(config.write_policy, WritePolicy::ForceNetwork);
        assert_eq!(config.push_fan_out, 4);
        assert_eq!(config.ttl(), Duration::ZERO);
    }

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        let config = DataStoreConfig::default().with_ttl(Duration::from_millis(500));
        assert_eq!(config.ttl, 1);
        let config = DataStoreConfig::default().with_ttl(Duration::from_millis(60_001));
        assert_eq!(config.ttl, 61);
        let config = DataStoreConfig::default().with_ttl(Duration::from_secs(60));
        assert_eq!(config.ttl, 60);
        let config = DataStoreConfig::default().with_ttl(Duration::MAX);
        assert_eq!(config.ttl, u64::MAX);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "store": { "kind": "sqlite", "path": "/tmp/offsync.db" },
                "gateway": { "base_url": "https://api.example.com/appdata/app/" },
                "defaults": { "ttl": 60 },
                "collections": { "books": { "delta_set": true, "read_policy": "local_only" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.store["kind"], "sqlite");
        assert_eq!(config.gateway.as_ref().unwrap().timeout_secs, 30);
        assert_eq!(config.datastore_config("films").ttl, 60);

        let books = config.datastore_config("books");
        assert!(books.delta_set);
        assert_eq!(books.read_policy, ReadPolicy::LocalOnly);
        assert_eq!(books.ttl, 0);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsync.json");
        let config = EngineConfig {
            defaults: DataStoreConfig::default()
                .with_ttl(Duration::from_secs(300))
                .with_sync_mode(SyncMode::Periodic {
                    interval: Duration::from_secs(30),
                }),
            ..EngineConfig::default()
        };

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }
}
