//! Per-collection record cache.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::entry::{is_stale, DeltaBaseline, QueryEntry};
use crate::manager::CacheFault;
use offsync_common::{CollectionName, Error, Fingerprint, Query, Record, Result};
use offsync_storage::{retry_once, BatchOp, DurableStore};

const QUERY_PREFIX: &str = "fp:";
const TOKEN_PREFIX: &str = "id:";

/// What a staleness check is about.
#[derive(Debug, Clone, Copy)]
pub enum CacheKey<'a> {
    /// A single record by id.
    Record(&'a str),
    /// A cached query result.
    Query(&'a Fingerprint),
}

/// Result of a delta refresh, applied in one step.
#[derive(Debug, Clone, Default)]
pub struct DeltaUpdate {
    /// Records fetched because they are new or changed.
    pub fetched: Vec<Record>,
    /// Previously indexed ids the remote no longer returns.
    pub removed: Vec<String>,
    /// The full result id list, in result order.
    pub ids: Vec<String>,
    /// Remote `lastModifiedAt` for every id in `ids`.
    pub tokens: BTreeMap<String, DateTime<Utc>>,
}

/// Record snapshots, query index and delta tokens of one collection.
///
/// Writes replace whole snapshots and drop every query index entry of the
/// collection. All access is serialized by one lock per collection.
///
/// When stored bytes cannot be decoded the cache latches into a corrupt
/// state: the fault is published once through the manager's fault channel
/// and every later call returns [`Error::StorageCorrupt`].
pub struct Cache {
    collection: CollectionName,
    store: Arc<dyn DurableStore>,
    records_ns: String,
    queries_ns: String,
    deltas_ns: String,
    corrupt: Mutex<Option<String>>,
    faults: broadcast::Sender<CacheFault>,
}

impl Cache {
    /// Create the cache of `collection` over `store`.
    pub fn new(
        collection: CollectionName,
        store: Arc<dyn DurableStore>,
        faults: broadcast::Sender<CacheFault>,
    ) -> Self {
        Self {
            records_ns: format!("records/{}", collection),
            queries_ns: format!("queries/{}", collection),
            deltas_ns: format!("deltas/{}", collection),
            collection,
            store,
            corrupt: Mutex::new(None),
            faults,
        }
    }

    /// The collection this cache holds.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Whether the cache has latched into the corrupt state.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.lock().is_some()
    }

    /// Get one record.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        self.guarded(|| self.read_record(id))
    }

    /// Every cached record of the collection, ordered by id.
    pub fn get_all(&self) -> Result<Vec<Record>> {
        self.guarded(|| self.read_all())
    }

    /// The cached result of a query, or `None` on a cache miss.
    ///
    /// An index entry whose records are no longer all present counts as
    /// a miss.
    pub fn get_by_query(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<Record>>> {
        self.guarded(|| {
            let Some(entry) = self.read_query(fingerprint)? else {
                return Ok(None);
            };
            let mut records = Vec::with_capacity(entry.ids.len());
            for id in &entry.ids {
                match self.read_record(id)? {
                    Some(record) => records.push(record),
                    None => return Ok(None),
                }
            }
            Ok(Some(records))
        })
    }

    /// Replace the snapshot of one record.
    ///
    /// # Errors
    /// - The record has no id
    pub fn put(&self, record: Record) -> Result<()> {
        self.put_all(vec![record])
    }

    /// Replace the snapshots of several records.
    pub fn put_all(&self, records: Vec<Record>) -> Result<()> {
        let ops = records_to_ops(records)?;
        self.guarded(|| {
            self.write(&self.records_ns, ops)?;
            self.invalidate_queries_locked()
        })
    }

    /// Record the ids a query returned.
    pub fn put_query_result(
        &self,
        fingerprint: &Fingerprint,
        ids: Vec<String>,
        ttl: Duration,
    ) -> Result<()> {
        self.guarded(|| self.write_query(fingerprint, ids, ttl))
    }

    /// Store the records of a query result and index them under `fingerprint`.
    pub fn store_query_result(
        &self,
        fingerprint: &Fingerprint,
        records: Vec<Record>,
        ttl: Duration,
    ) -> Result<()> {
        let ids = records
            .iter()
            .map(|r| required_id(r).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        let ops = records_to_ops(records)?;
        self.guarded(|| {
            self.write(&self.records_ns, ops)?;
            self.invalidate_queries_locked()?;
            self.write_query(fingerprint, ids, ttl)
        })
    }

    /// Remove one record. Returns whether it was cached.
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.guarded(|| {
            let existed = retry_once(|| self.store.delete(&self.records_ns, id))?;
            self.invalidate_queries_locked()?;
            Ok(existed)
        })
    }

    /// Remove every record a cached query result refers to.
    pub fn remove_by_query(&self, fingerprint: &Fingerprint) -> Result<usize> {
        self.guarded(|| {
            let Some(entry) = self.read_query(fingerprint)? else {
                return Ok(0);
            };
            let mut removed = 0;
            for id in &entry.ids {
                if retry_once(|| self.store.delete(&self.records_ns, id))? {
                    removed += 1;
                }
            }
            self.invalidate_queries_locked()?;
            Ok(removed)
        })
    }

    /// Remove every cached record the query's filter matches.
    ///
    /// Returns the removed ids.
    pub fn remove_matching(&self, query: &Query) -> Result<Vec<String>> {
        self.guarded(|| {
            let ids: Vec<String> = self
                .read_all()?
                .into_iter()
                .filter(|r| query.matches(r))
                .filter_map(|r| r.id)
                .collect();
            let ops = ids
                .iter()
                .map(|id| BatchOp::Delete { key: id.clone() })
                .collect();
            self.write(&self.records_ns, ops)?;
            self.invalidate_queries_locked()?;
            Ok(ids)
        })
    }

    /// Evaluate a query against the cached records.
    pub fn find_matching(&self, query: &Query) -> Result<Vec<Record>> {
        self.guarded(|| Ok(query.apply(self.read_all()?)))
    }

    /// Number of cached records, optionally restricted to a filter.
    pub fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.guarded(|| {
            let records = self.read_all()?;
            Ok(match query {
                Some(query) => records.iter().filter(|r| query.matches(r)).count(),
                None => records.len(),
            })
        })
    }

    /// Whether a record or query result must be refetched.
    ///
    /// Absent entries are stale. Records are judged against `ttl`; query
    /// entries against the ttl they were stored with.
    pub fn is_stale(&self, key: CacheKey<'_>, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        self.guarded(|| match key {
            CacheKey::Record(id) => Ok(self
                .read_record(id)?
                .map(|r| is_stale(r.metadata.last_received_at, ttl.as_secs(), now))
                .unwrap_or(true)),
            CacheKey::Query(fingerprint) => Ok(self
                .read_query(fingerprint)?
                .map(|entry| entry.is_stale_at(now))
                .unwrap_or(true)),
        })
    }

    /// Drop every query index entry of the collection.
    pub fn invalidate_queries(&self) -> Result<()> {
        self.guarded(|| self.invalidate_queries_locked())
    }

    /// The delta baseline of a query, if one was recorded.
    ///
    /// Tokens of ids whose record is no longer cached are left out, so
    /// those ids count as changed.
    pub fn delta_baseline(&self, fingerprint: &Fingerprint) -> Result<Option<DeltaBaseline>> {
        self.guarded(|| {
            let key = format!("{}{}", QUERY_PREFIX, fingerprint);
            let Some(bytes) = retry_once(|| self.store.get(&self.deltas_ns, &key))? else {
                return Ok(None);
            };
            let ids: Vec<String> = self.decode(&bytes, "delta baseline")?;

            let mut tokens = BTreeMap::new();
            for id in &ids {
                if self.read_record(id)?.is_none() {
                    continue;
                }
                if let Some(token) = self.read_token(id)? {
                    tokens.insert(id.clone(), token);
                }
            }
            Ok(Some(DeltaBaseline { ids, tokens }))
        })
    }

    /// Record the delta baseline of a query.
    pub fn put_delta(
        &self,
        fingerprint: &Fingerprint,
        tokens: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<()> {
        let ids: Vec<&String> = tokens.keys().collect();
        let mut ops = vec![BatchOp::Put {
            key: format!("{}{}", QUERY_PREFIX, fingerprint),
            value: encode(&ids)?,
        }];
        for (id, token) in tokens {
            ops.push(BatchOp::Put {
                key: format!("{}{}", TOKEN_PREFIX, id),
                value: encode(token)?,
            });
        }
        self.guarded(|| self.write(&self.deltas_ns, ops))
    }

    /// Apply the outcome of a delta refresh.
    pub fn apply_delta(
        &self,
        fingerprint: &Fingerprint,
        update: DeltaUpdate,
        ttl: Duration,
    ) -> Result<()> {
        let DeltaUpdate {
            fetched,
            removed,
            ids,
            tokens,
        } = update;
        debug!(
            "Delta refresh of {}: {} fetched, {} removed, {} total",
            self.collection,
            fetched.len(),
            removed.len(),
            ids.len()
        );

        let mut record_ops = records_to_ops(fetched)?;
        let mut token_ops = Vec::with_capacity(removed.len());
        for id in &removed {
            record_ops.push(BatchOp::Delete { key: id.clone() });
            token_ops.push(BatchOp::Delete {
                key: format!("{}{}", TOKEN_PREFIX, id),
            });
        }
        self.guarded(|| {
            self.write(&self.records_ns, record_ops)?;
            self.write(&self.deltas_ns, token_ops)?;
            self.invalidate_queries_locked()?;
            self.write_query(fingerprint, ids, ttl)
        })?;
        self.put_delta(fingerprint, &tokens)
    }

    /// Forget the delta token of a record confirmed deleted server-side.
    pub fn forget_delta(&self, id: &str) -> Result<()> {
        let key = format!("{}{}", TOKEN_PREFIX, id);
        self.guarded(|| retry_once(|| self.store.delete(&self.deltas_ns, &key)).map(|_| ()))
    }

    /// Move a record from a temporary id to its committed snapshot.
    pub fn rekey(&self, old_id: &str, record: Record) -> Result<()> {
        let mut ops = vec![BatchOp::Delete {
            key: old_id.to_string(),
        }];
        ops.extend(records_to_ops(vec![record])?);
        self.guarded(|| {
            self.write(&self.records_ns, ops)?;
            self.invalidate_queries_locked()
        })
    }

    /// Drop everything cached for the collection.
    pub fn clear(&self) -> Result<()> {
        self.guarded(|| {
            for ns in [&self.records_ns, &self.queries_ns, &self.deltas_ns] {
                retry_once(|| self.store.clear(ns))?;
            }
            Ok(())
        })
    }

    /// Run `f` under the collection lock, latching on corruption.
    fn guarded<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut corrupt = self.corrupt.lock();
        if let Some(reason) = corrupt.as_ref() {
            return Err(Error::StorageCorrupt(reason.clone()));
        }

        match f() {
            Err(Error::StorageCorrupt(reason)) => {
                error!("Cache of {} is corrupt: {}", self.collection, reason);
                *corrupt = Some(reason.clone());
                // No subscribers is fine; the latch still applies.
                let _ = self.faults.send(CacheFault {
                    collection: self.collection.clone(),
                    reason: reason.clone(),
                });
                Err(Error::StorageCorrupt(reason))
            }
            other => other,
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8], what: &str) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::StorageCorrupt(format!("undecodable {} in {}: {}", what, self.collection, e))
        })
    }

    fn write(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        retry_once(|| self.store.write_batch(namespace, ops.clone()))
    }

    fn read_record(&self, id: &str) -> Result<Option<Record>> {
        retry_once(|| self.store.get(&self.records_ns, id))?
            .map(|bytes| self.decode(&bytes, "record"))
            .transpose()
    }

    fn read_all(&self) -> Result<Vec<Record>> {
        retry_once(|| self.store.scan(&self.records_ns))?
            .into_iter()
            .map(|(_, bytes)| self.decode(&bytes, "record"))
            .collect()
    }

    fn read_query(&self, fingerprint: &Fingerprint) -> Result<Option<QueryEntry>> {
        retry_once(|| self.store.get(&self.queries_ns, fingerprint.as_str()))?
            .map(|bytes| self.decode(&bytes, "query entry"))
            .transpose()
    }

    fn read_token(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let key = format!("{}{}", TOKEN_PREFIX, id);
        retry_once(|| self.store.get(&self.deltas_ns, &key))?
            .map(|bytes| self.decode(&bytes, "delta token"))
            .transpose()
    }

    fn write_query(&self, fingerprint: &Fingerprint, ids: Vec<String>, ttl: Duration) -> Result<()> {
        let entry = QueryEntry {
            ids,
            received_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        };
        let value = encode(&entry)?;
        retry_once(|| {
            self.store
                .put(&self.queries_ns, fingerprint.as_str(), value.clone())
        })
    }

    fn invalidate_queries_locked(&self) -> Result<()> {
        retry_once(|| self.store.clear(&self.queries_ns)).map(|_| ())
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn required_id(record: &Record) -> Result<&str> {
    record
        .id()
        .ok_or_else(|| Error::InvalidInput("Cannot cache a record without an id".to_string()))
}

fn records_to_ops(records: Vec<Record>) -> Result<Vec<BatchOp>> {
    records
        .into_iter()
        .map(|record| {
            let key = required_id(&record)?.to_string();
            let value = encode(&record.to_wire())?;
            Ok(BatchOp::Put { key, value })
        })
        .collect()
}
