//! Operation state machines.
//!
//! Every public call of a [`DataStore`](crate::DataStore) runs as one
//! operation: a spawned task that consults the cache, the pending queue
//! and the network gateway in the order its policy dictates, and reports
//! through a [`Response`](crate::Response).
//!
//! Reads share one pipeline ([`read::execute_read`]) parameterized by a
//! [`read::ReadOperation`]; writes and queue maintenance have their own
//! state machines.

mod count;
mod find;
mod get;
mod purge;
mod push;
mod read;
mod remove;
mod save;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use offsync_cache::Cache;
use offsync_common::{CollectionName, Error, Record, Result};
use offsync_gateway::{GatewayResponse, NetworkGateway, RequestFactory, SerializedRequest};

use crate::config::DataStoreConfig;
use crate::conflict::ConflictResolver;
use crate::queue::PendingQueue;

pub(crate) use count::CountOperation;
pub(crate) use find::FindOperation;
pub(crate) use get::GetOperation;
pub(crate) use purge::{execute_clear, execute_purge};
pub(crate) use push::execute_push;
pub use push::{PushFailure, PushOutcome};
pub(crate) use read::{execute_read, run_read};
pub(crate) use remove::execute_remove;
pub use remove::RemoveTarget;
pub(crate) use save::execute_save;

/// Everything an operation of one collection works with.
#[derive(Clone)]
pub(crate) struct OperationContext {
    pub(crate) cache: Arc<Cache>,
    pub(crate) queue: Arc<PendingQueue>,
    pub(crate) gateway: Arc<dyn NetworkGateway>,
    pub(crate) factory: RequestFactory,
    pub(crate) config: DataStoreConfig,
    pub(crate) resolver: ConflictResolver,
}

impl OperationContext {
    pub(crate) fn new(
        cache: Arc<Cache>,
        queue: Arc<PendingQueue>,
        gateway: Arc<dyn NetworkGateway>,
        config: DataStoreConfig,
    ) -> Self {
        Self {
            factory: RequestFactory::new(cache.collection().clone()),
            resolver: ConflictResolver::new(config.conflict_strategy),
            cache,
            queue,
            gateway,
            config,
        }
    }

    pub(crate) fn collection(&self) -> &CollectionName {
        self.cache.collection()
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.config.ttl()
    }

    /// Send through the gateway unless the request is already cancelled.
    pub(crate) async fn send(
        &self,
        request: &SerializedRequest,
        token: &CancellationToken,
    ) -> Result<GatewayResponse> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!("{:?} {}", request.method, request.path);
        self.gateway.send(request, token).await
    }

    /// Ids of records with queued writes.
    pub(crate) async fn pending_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .queue
            .list(None)
            .await?
            .into_iter()
            .filter_map(|op| op.object_id)
            .collect())
    }
}

/// Swallow cache corruption.
///
/// A corrupt cache has already been reported on the fault channel; the
/// operation carries on as if the cache were absent.
pub(crate) fn tolerate_corrupt<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(Error::StorageCorrupt(reason)) => {
            debug!("Skipping corrupt cache: {}", reason);
            Ok(T::default())
        }
        other => other,
    }
}

/// Replace fetched records that have queued writes by their local copy.
///
/// A record with queued writes but no local copy was removed locally and
/// is left out.
pub(crate) fn overlay_pending(
    ctx: &OperationContext,
    records: Vec<Record>,
    pending: &HashSet<String>,
) -> Result<Vec<Record>> {
    if pending.is_empty() {
        return Ok(records);
    }
    let mut merged = Vec::with_capacity(records.len());
    for record in records {
        let queued = record
            .id()
            .filter(|id| pending.contains(*id))
            .map(str::to_string);
        let Some(id) = queued else {
            merged.push(record);
            continue;
        };
        match ctx.cache.get(&id) {
            Ok(Some(local)) => merged.push(local),
            Ok(None) => {}
            Err(Error::StorageCorrupt(_)) => merged.push(record),
            Err(e) => return Err(e),
        }
    }
    Ok(merged)
}
