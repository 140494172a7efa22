//! Record counts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use offsync_cache::CacheKey;
use offsync_common::{Query, Result};

use super::read::ReadOperation;
use super::OperationContext;

/// Count the records a query matches.
///
/// Counts are not cached on their own. A `Both` count is answered early
/// only from a fresh cached result of the same query.
pub(crate) struct CountOperation {
    query: Query,
}

impl CountOperation {
    pub(crate) fn new(query: Query) -> Self {
        Self { query }
    }
}

#[async_trait]
impl ReadOperation for CountOperation {
    type Output = u64;
    type Fetched = u64;

    fn read_cached(&self, ctx: &OperationContext) -> Result<Option<u64>> {
        let fingerprint = self.query.fingerprint();
        if ctx.cache.is_stale(CacheKey::Query(&fingerprint), ctx.ttl())? {
            return Ok(None);
        }
        Ok(ctx
            .cache
            .get_by_query(&fingerprint)?
            .map(|records| records.len() as u64))
    }

    fn read_local(&self, ctx: &OperationContext) -> Result<u64> {
        Ok(ctx.cache.count(Some(&self.query))? as u64)
    }

    async fn fetch(&self, ctx: &OperationContext, token: &CancellationToken) -> Result<u64> {
        ctx.send(&ctx.factory.count(&self.query), token)
            .await?
            .into_count()
    }

    fn apply(&self, _ctx: &OperationContext, count: u64) -> Result<u64> {
        Ok(count)
    }
}
