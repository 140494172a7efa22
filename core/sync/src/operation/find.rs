//! Query reads, with optional delta-set refresh.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use offsync_cache::{CacheKey, DeltaBaseline, DeltaUpdate};
use offsync_common::{Error, Query, Record, Result};

use super::read::ReadOperation;
use super::{overlay_pending, tolerate_corrupt, OperationContext};

/// Find the records a query matches.
pub(crate) struct FindOperation {
    query: Query,
    delta: bool,
    prune: bool,
}

impl FindOperation {
    pub(crate) fn new(query: Query, delta: bool) -> Self {
        Self {
            query,
            delta,
            prune: false,
        }
    }

    /// Also drop cached records that match the query but were not
    /// returned. Only unbounded queries (no limit, no skip) prune.
    pub(crate) fn pruning(mut self) -> Self {
        self.prune = true;
        self
    }

    async fn fetch_full(
        &self,
        ctx: &OperationContext,
        token: &CancellationToken,
    ) -> Result<Vec<Record>> {
        ctx.send(&ctx.factory.find(&self.query, false), token)
            .await?
            .into_records()
    }

    /// Ask for ids and modification times, then fetch only what changed.
    async fn fetch_delta(
        &self,
        ctx: &OperationContext,
        token: &CancellationToken,
        baseline: DeltaBaseline,
    ) -> Result<DeltaUpdate> {
        let remote = ctx
            .send(&ctx.factory.find(&self.query, true), token)
            .await?
            .into_tokens()?;
        let changed: Vec<String> = baseline.changed(&remote).cloned().collect();
        let removed: Vec<String> = baseline.removed(&remote).cloned().collect();

        let fetched = if changed.is_empty() {
            Vec::new()
        } else {
            ctx.send(&ctx.factory.find(&Query::by_ids(changed), false), token)
                .await?
                .into_records()?
        };

        Ok(DeltaUpdate {
            fetched,
            removed,
            ids: remote.keys().cloned().collect(),
            tokens: remote,
        })
    }

    fn apply_full(
        &self,
        ctx: &OperationContext,
        mut records: Vec<Record>,
        pending: &HashSet<String>,
    ) -> Result<Vec<Record>> {
        let fingerprint = self.query.fingerprint();
        let now = Utc::now();
        for record in &mut records {
            record.mark_received(now);
        }
        let records = overlay_pending(ctx, records, pending)?;

        if self.prune && self.query.limit.is_none() && self.query.skip.is_none() {
            let dropped = tolerate_corrupt(ctx.cache.remove_matching(&self.query))?;
            debug!("Pruned {} cached records of {}", dropped.len(), ctx.collection());
        }
        tolerate_corrupt(ctx.cache.store_query_result(&fingerprint, records.clone(), ctx.ttl()))?;

        if self.delta {
            let tokens: BTreeMap<_, _> = records
                .iter()
                .filter_map(|r| Some((r.id.clone()?, r.metadata.last_modified_at?)))
                .collect();
            tolerate_corrupt(ctx.cache.put_delta(&fingerprint, &tokens))?;
        }
        Ok(records)
    }

    fn apply_delta(
        &self,
        ctx: &OperationContext,
        mut update: DeltaUpdate,
        pending: &HashSet<String>,
    ) -> Result<Vec<Record>> {
        let fingerprint = self.query.fingerprint();
        let now = Utc::now();
        for record in &mut update.fetched {
            record.mark_received(now);
        }
        update.fetched = overlay_pending(ctx, std::mem::take(&mut update.fetched), pending)?;

        // Unchanged records come from the cache. Results are assembled in
        // id order, then the query's sort is applied.
        let mut fetched: HashMap<String, Record> = update
            .fetched
            .iter()
            .filter_map(|r| Some((r.id.clone()?, r.clone())))
            .collect();
        let mut records = Vec::with_capacity(update.ids.len());
        for id in &update.ids {
            match fetched.remove(id) {
                Some(record) => records.push(record),
                None => records.extend(ctx.cache.get(id)?),
            }
        }
        let order = Query {
            sort: self.query.sort.clone(),
            ..Query::default()
        };
        let records = order.apply(records);
        update.ids = records.iter().filter_map(|r| r.id.clone()).collect();

        ctx.cache.apply_delta(&fingerprint, update, ctx.ttl())?;
        Ok(records)
    }
}

/// Network result of a find.
pub(crate) enum Fetched {
    Full(Vec<Record>, HashSet<String>),
    Delta(DeltaUpdate, HashSet<String>),
}

#[async_trait]
impl ReadOperation for FindOperation {
    type Output = Vec<Record>;
    type Fetched = Fetched;

    fn read_cached(&self, ctx: &OperationContext) -> Result<Option<Vec<Record>>> {
        let fingerprint = self.query.fingerprint();
        if ctx.cache.is_stale(CacheKey::Query(&fingerprint), ctx.ttl())? {
            return Ok(None);
        }
        ctx.cache.get_by_query(&fingerprint)
    }

    /// Without an indexed result the cached records are scanned.
    fn read_local(&self, ctx: &OperationContext) -> Result<Vec<Record>> {
        match ctx.cache.get_by_query(&self.query.fingerprint())? {
            Some(records) => Ok(records),
            None => ctx.cache.find_matching(&self.query),
        }
    }

    async fn fetch(&self, ctx: &OperationContext, token: &CancellationToken) -> Result<Fetched> {
        let baseline = if self.delta {
            match ctx.cache.delta_baseline(&self.query.fingerprint()) {
                Ok(baseline) => baseline,
                Err(Error::StorageCorrupt(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let fetched = match baseline {
            Some(baseline) => {
                let update = self.fetch_delta(ctx, token, baseline).await?;
                Fetched::Delta(update, ctx.pending_ids().await?)
            }
            None => {
                let records = self.fetch_full(ctx, token).await?;
                Fetched::Full(records, ctx.pending_ids().await?)
            }
        };
        Ok(fetched)
    }

    fn apply(&self, ctx: &OperationContext, fetched: Fetched) -> Result<Vec<Record>> {
        match fetched {
            Fetched::Full(records, pending) => self.apply_full(ctx, records, &pending),
            Fetched::Delta(update, pending) => self.apply_delta(ctx, update, &pending),
        }
    }
}
