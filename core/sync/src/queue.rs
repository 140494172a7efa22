//! Durable queue of pending (not yet acknowledged) writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use offsync_common::{CollectionName, Error, Result};
use offsync_gateway::SerializedRequest;
use offsync_storage::{BatchOp, DurableStore, RetryExecutor};

/// Kind of a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// New record, still under a temporary id.
    Create,
    /// Replacement of a committed record.
    Update,
    /// Removal of a record, or of every record a query matches.
    Delete,
}

/// A write waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Position in the queue; replay order.
    pub sequence: u64,
    /// Collection the write belongs to.
    pub collection: String,
    /// Target record, or `None` for a query-wide write.
    pub object_id: Option<String>,
    /// Kind of write.
    pub change: ChangeType,
    /// The request to replay.
    pub request: SerializedRequest,
    /// When the write was queued.
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    fn key(&self) -> String {
        sequence_key(self.sequence)
    }
}

fn sequence_key(sequence: u64) -> String {
    format!("{:020}", sequence)
}

/// Ordered, durable log of pending writes for one collection.
///
/// Entries are persisted under `pending/<collection>` keyed by a
/// zero-padded sequence, so a scan returns them in replay order and the
/// order survives a restart. Store calls run on the blocking pool and a
/// transient failure is retried once.
pub struct PendingQueue {
    collection: CollectionName,
    namespace: String,
    store: Arc<dyn DurableStore>,
    retry: RetryExecutor,
    next_sequence: Mutex<u64>,
    replay: Mutex<()>,
}

impl PendingQueue {
    /// Open the queue of `collection`, recovering the next sequence.
    pub async fn open(collection: CollectionName, store: Arc<dyn DurableStore>) -> Result<Self> {
        let queue = Self {
            namespace: format!("pending/{}", collection),
            collection,
            store,
            retry: RetryExecutor::default(),
            next_sequence: Mutex::new(1),
            replay: Mutex::new(()),
        };

        let last = queue.load_all().await?.last().map(|op| op.sequence);
        if let Some(last) = last {
            *queue.next_sequence.lock().await = last + 1;
            debug!("Recovered pending queue of {} at sequence {}", queue.collection, last);
        }
        Ok(queue)
    }

    /// The collection this queue belongs to.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Append a write, coalescing it with pending writes to the same record.
    ///
    /// - a delete after a pending create cancels both: nothing is queued
    ///   and `None` is returned
    /// - a delete drops pending updates of the record
    /// - a create or update of a record whose create is still pending
    ///   replaces that create
    ///
    /// Updates of committed records are never merged.
    pub async fn enqueue(
        &self,
        object_id: Option<&str>,
        change: ChangeType,
        request: SerializedRequest,
    ) -> Result<Option<PendingOperation>> {
        let mut next = self.next_sequence.lock().await;

        let existing = match object_id {
            Some(id) => self.load_for(id).await?,
            None => Vec::new(),
        };
        let pending_create = existing.iter().any(|op| op.change == ChangeType::Create);

        let (obsolete, change): (Vec<&PendingOperation>, Option<ChangeType>) = match change {
            ChangeType::Delete if pending_create => (existing.iter().collect(), None),
            ChangeType::Delete => (
                existing
                    .iter()
                    .filter(|op| op.change == ChangeType::Update)
                    .collect(),
                Some(ChangeType::Delete),
            ),
            _ if pending_create => (existing.iter().collect(), Some(ChangeType::Create)),
            other => (Vec::new(), Some(other)),
        };

        let mut ops: Vec<BatchOp> = obsolete
            .iter()
            .map(|op| BatchOp::Delete { key: op.key() })
            .collect();

        let queued = match change {
            Some(change) => {
                let op = PendingOperation {
                    sequence: *next,
                    collection: self.collection.to_string(),
                    object_id: object_id.map(str::to_string),
                    change,
                    request,
                    enqueued_at: Utc::now(),
                };
                ops.push(BatchOp::Put {
                    key: op.key(),
                    value: serde_json::to_vec(&op)?,
                });
                Some(op)
            }
            None => None,
        };

        if !obsolete.is_empty() {
            debug!(
                "Coalesced {} pending operations for {:?} in {}",
                obsolete.len(),
                object_id,
                self.collection
            );
        }
        self.write(ops).await?;
        if queued.is_some() {
            *next += 1;
        }
        Ok(queued)
    }

    /// Pending writes in replay order; restricted to one record when
    /// `object_id` is given.
    pub async fn list(&self, object_id: Option<&str>) -> Result<Vec<PendingOperation>> {
        match object_id {
            Some(id) => self.load_for(id).await,
            None => self.load_all().await,
        }
    }

    /// Remove an acknowledged write. Returns whether it was still queued.
    pub async fn remove(&self, op: &PendingOperation) -> Result<bool> {
        let _guard = self.next_sequence.lock().await;
        let namespace = self.namespace.clone();
        let key = op.key();
        self.blocking(move |store| store.delete(&namespace, &key)).await
    }

    /// Drop pending writes without replaying them; all of them when
    /// `object_id` is `None`. Returns how many were dropped.
    pub async fn clear(&self, object_id: Option<&str>) -> Result<usize> {
        let _guard = self.next_sequence.lock().await;
        match object_id {
            None => {
                let namespace = self.namespace.clone();
                self.blocking(move |store| store.clear(&namespace)).await
            }
            Some(id) => {
                let doomed = self.load_for(id).await?;
                let ops = doomed
                    .iter()
                    .map(|op| BatchOp::Delete { key: op.key() })
                    .collect();
                self.write(ops).await?;
                Ok(doomed.len())
            }
        }
    }

    /// Number of pending writes.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.load_all().await?.len())
    }

    /// Move the pending writes of a temporary id to the committed id.
    ///
    /// They are re-queued at the tail, in their original relative order,
    /// with requests pointed at `new_id`. A create becomes an update.
    pub async fn retarget(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let mut next = self.next_sequence.lock().await;
        let moved = self.load_for(old_id).await?;
        if moved.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(moved.len() * 2);
        let mut sequence = *next;
        for op in &moved {
            ops.push(BatchOp::Delete { key: op.key() });
            let change = match op.change {
                ChangeType::Create => ChangeType::Update,
                other => other,
            };
            let retargeted = PendingOperation {
                sequence,
                collection: op.collection.clone(),
                object_id: Some(new_id.to_string()),
                change,
                request: op.request.retarget(new_id),
                enqueued_at: op.enqueued_at,
            };
            ops.push(BatchOp::Put {
                key: retargeted.key(),
                value: serde_json::to_vec(&retargeted)?,
            });
            sequence += 1;
        }

        self.write(ops).await?;
        *next = sequence;
        debug!(
            "Retargeted {} pending operations from {} to {}",
            moved.len(),
            old_id,
            new_id
        );
        Ok(moved.len())
    }

    /// Serializes replays of this queue. Held for the duration of a push.
    pub(crate) async fn lock_replay(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.replay.lock().await
    }

    async fn load_all(&self) -> Result<Vec<PendingOperation>> {
        let namespace = self.namespace.clone();
        let entries = self.blocking(move |store| store.scan(&namespace)).await?;
        entries
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| {
                    Error::StorageCorrupt(format!("undecodable pending operation {}: {}", key, e))
                })
            })
            .collect()
    }

    async fn load_for(&self, object_id: &str) -> Result<Vec<PendingOperation>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|op| op.object_id.as_deref() == Some(object_id))
            .collect())
    }

    async fn write(&self, ops: Vec<BatchOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let namespace = self.namespace.clone();
        self.blocking(move |store| store.write_batch(&namespace, ops.clone()))
            .await
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn DurableStore) -> Result<T> + Clone + Send + 'static,
    {
        self.retry
            .execute(|| {
                let store = self.store.clone();
                let call = call.clone();
                async move {
                    tokio::task::spawn_blocking(move || call(store.as_ref()))
                        .await
                        .map_err(|e| Error::Storage(format!("queue task failed: {}", e)))?
                }
            })
            .await
    }
}
