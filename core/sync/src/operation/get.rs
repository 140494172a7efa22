//! Single-record reads.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use offsync_cache::CacheKey;
use offsync_common::{is_temp_id, Error, Record, Result};

use super::read::ReadOperation;
use super::{tolerate_corrupt, OperationContext};

/// Read one record by id.
pub(crate) struct GetOperation {
    id: String,
    require_presence: bool,
}

impl GetOperation {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            require_presence: false,
        }
    }

    /// Report a local miss as `NotFoundLocally` instead of `None`.
    pub(crate) fn required(mut self) -> Self {
        self.require_presence = true;
        self
    }
}

pub(crate) enum Fetched {
    /// The server copy.
    Remote(Record),
    /// The record has queued writes or was never pushed; the local copy wins.
    Local,
    /// The server no longer has the record.
    Gone(Error),
}

#[async_trait]
impl ReadOperation for GetOperation {
    type Output = Option<Record>;
    type Fetched = Fetched;

    fn read_cached(&self, ctx: &OperationContext) -> Result<Option<Option<Record>>> {
        if ctx.cache.is_stale(CacheKey::Record(&self.id), ctx.ttl())? {
            return Ok(None);
        }
        Ok(ctx.cache.get(&self.id)?.map(Some))
    }

    fn read_local(&self, ctx: &OperationContext) -> Result<Option<Record>> {
        match ctx.cache.get(&self.id)? {
            None if self.require_presence => Err(Error::NotFoundLocally(self.id.clone())),
            found => Ok(found),
        }
    }

    async fn fetch(&self, ctx: &OperationContext, token: &CancellationToken) -> Result<Fetched> {
        if is_temp_id(&self.id) {
            return Ok(Fetched::Local);
        }
        let record = match ctx.send(&ctx.factory.get_by_id(&self.id), token).await {
            Ok(response) => response.into_record()?,
            Err(err @ Error::NotFound(_)) => return Ok(Fetched::Gone(err)),
            Err(e) => return Err(e),
        };
        if ctx.queue.list(Some(&self.id)).await?.is_empty() {
            Ok(Fetched::Remote(record))
        } else {
            Ok(Fetched::Local)
        }
    }

    fn apply(&self, ctx: &OperationContext, fetched: Fetched) -> Result<Option<Record>> {
        match fetched {
            Fetched::Remote(mut record) => {
                record.mark_received(Utc::now());
                tolerate_corrupt(ctx.cache.put(record.clone()))?;
                Ok(Some(record))
            }
            Fetched::Local => tolerate_corrupt(ctx.cache.get(&self.id)),
            Fetched::Gone(err) => {
                debug!("{} {} is gone server-side", ctx.collection(), self.id);
                tolerate_corrupt(ctx.cache.remove(&self.id))?;
                tolerate_corrupt(ctx.cache.forget_delta(&self.id))?;
                Err(err)
            }
        }
    }
}
