//! Record removal, by id or by query.

use tracing::{debug, warn};

use offsync_common::{is_temp_id, Error, Query, Result};

use super::push::replay_now;
use super::{tolerate_corrupt, OperationContext};
use crate::completion::{launch, Emitter, Response};
use crate::config::WritePolicy;
use crate::queue::{ChangeType, PendingOperation};
use crate::request::Request;

/// What a remove applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveTarget {
    /// One record.
    Id(String),
    /// Every record the query matches.
    Query(Query),
}

impl From<&str> for RemoveTarget {
    fn from(id: &str) -> Self {
        RemoveTarget::Id(id.to_string())
    }
}

impl From<Query> for RemoveTarget {
    fn from(query: Query) -> Self {
        RemoveTarget::Query(query)
    }
}

/// Remove records under `policy`. The value is the number of records
/// removed: by the backend for `ForceNetwork`, from the cache otherwise.
pub(crate) fn execute_remove(
    ctx: OperationContext,
    target: RemoveTarget,
    policy: WritePolicy,
) -> Response<u64> {
    launch(Request::new(), move |emitter| async move {
        match policy {
            WritePolicy::ForceNetwork => remove_remote(&ctx, target, &emitter).await,
            WritePolicy::ForceLocal => remove_local(&ctx, target, &emitter).await.map(|_| ()),
            WritePolicy::LocalThenNetwork => {
                let Some(op) = remove_local(&ctx, target, &emitter).await? else {
                    return Ok(());
                };
                match replay_now(&ctx, &op, emitter.request()).await {
                    Ok(Some(report)) => {
                        if let Some(err) = report.first_error {
                            warn!("Remove left queued: {}", err);
                        }
                    }
                    Ok(None) => debug!("Remove queued behind earlier writes"),
                    Err(e) => warn!("Remove left queued: {}", e),
                }
                Ok(())
            }
        }
    })
}

async fn remove_remote(
    ctx: &OperationContext,
    target: RemoveTarget,
    emitter: &Emitter<u64>,
) -> Result<()> {
    let token = emitter.request().token();
    match target {
        // Never reached the backend: only local state to drop.
        RemoveTarget::Id(id) if is_temp_id(&id) => {
            ctx.queue.clear(Some(&id)).await?;
            let removed = emitter
                .request()
                .while_live(|| tolerate_corrupt(ctx.cache.remove(&id)))
                .unwrap_or(Err(Error::Cancelled))?;
            emitter.refreshed(u64::from(removed));
        }
        RemoveTarget::Id(id) => {
            let count = match ctx.send(&ctx.factory.remove_by_id(&id), &token).await {
                Ok(response) => response.into_count()?,
                Err(Error::NotFound(_)) => 0,
                Err(e) => return Err(e),
            };
            ctx.queue.clear(Some(&id)).await?;
            let applied = emitter.request().while_live(|| {
                tolerate_corrupt(ctx.cache.remove(&id))?;
                tolerate_corrupt(ctx.cache.forget_delta(&id))
            });
            applied.unwrap_or(Err(Error::Cancelled))?;
            emitter.refreshed(count);
        }
        RemoveTarget::Query(query) => {
            let count = ctx
                .send(&ctx.factory.remove_by_query(&query), &token)
                .await?
                .into_count()?;
            let applied = emitter.request().while_live(|| -> Result<()> {
                for id in tolerate_corrupt(ctx.cache.remove_matching(&query))? {
                    tolerate_corrupt(ctx.cache.forget_delta(&id))?;
                }
                Ok(())
            });
            applied.unwrap_or(Err(Error::Cancelled))?;
            emitter.refreshed(count);
        }
    }
    Ok(())
}

/// Remove locally and queue the removal. Records that never reached the
/// backend just lose their queued writes.
async fn remove_local(
    ctx: &OperationContext,
    target: RemoveTarget,
    emitter: &Emitter<u64>,
) -> Result<Option<PendingOperation>> {
    match target {
        RemoveTarget::Id(id) => {
            let removed = tolerate_corrupt(ctx.cache.remove(&id))?;
            emitter.cached(u64::from(removed));
            if is_temp_id(&id) {
                ctx.queue.clear(Some(&id)).await?;
                return Ok(None);
            }
            ctx.queue
                .enqueue(Some(&id), ChangeType::Delete, ctx.factory.remove_by_id(&id))
                .await
        }
        RemoveTarget::Query(query) => {
            let removed = tolerate_corrupt(ctx.cache.remove_matching(&query))?;
            emitter.cached(removed.len() as u64);
            for id in removed.iter().filter(|id| is_temp_id(id)) {
                ctx.queue.clear(Some(id)).await?;
            }
            ctx.queue
                .enqueue(None, ChangeType::Delete, ctx.factory.remove_by_query(&query))
                .await
        }
    }
}
