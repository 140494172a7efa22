//! Destructive discard of the pending queue and the cache.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, warn};

use offsync_common::{Error, Result};

use super::{tolerate_corrupt, OperationContext};
use crate::completion::{launch, Response};
use crate::queue::ChangeType;
use crate::request::{MultiRequest, Request};

/// Drop every queued write of the collection without replaying it.
///
/// Records created locally and never pushed disappear from the cache with
/// their queued create. Records with a queued update or delete get their
/// server copy back; a record gone server-side is evicted. A write whose
/// record cannot be refetched stays queued and the purge fails with the
/// first such error after emitting the number of dropped writes.
///
/// Every refetch is a child of the purge request: cancelling the purge
/// cancels the refetch in flight.
pub(crate) fn execute_purge(ctx: OperationContext) -> Response<usize> {
    let multi = MultiRequest::new();
    launch(multi.request().clone(), move |emitter| async move {
        let request = emitter.request().clone();
        let _replay = ctx.queue.lock_replay().await;
        let ops = ctx.queue.list(None).await?;
        if request.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut purged = 0;
        let mut first_error = None;
        let mut restored: HashMap<String, bool> = HashMap::new();
        for op in ops {
            match (op.change, op.object_id.as_deref()) {
                (ChangeType::Create, Some(id)) => {
                    request
                        .while_live(|| tolerate_corrupt(ctx.cache.remove(id)).map(|_| ()))
                        .unwrap_or(Err(Error::Cancelled))?;
                }
                (ChangeType::Update | ChangeType::Delete, Some(id)) => {
                    let ok = match restored.get(id) {
                        Some(ok) => *ok,
                        None => {
                            let refetch = refetch(ctx.clone(), id.to_string());
                            multi.add(refetch.request().clone())?;
                            let ok = match refetch.value().await {
                                Ok(()) => true,
                                Err(Error::Cancelled) => return Err(Error::Cancelled),
                                Err(err) => {
                                    warn!("Could not refetch {} while purging: {}", id, err);
                                    first_error.get_or_insert(err);
                                    false
                                }
                            };
                            restored.insert(id.to_string(), ok);
                            ok
                        }
                    };
                    if !ok {
                        continue;
                    }
                }
                _ => {}
            }
            if ctx.queue.remove(&op).await? {
                purged += 1;
            }
        }
        multi.close();

        request
            .while_live(|| tolerate_corrupt(ctx.cache.invalidate_queries()))
            .unwrap_or(Err(Error::Cancelled))?;

        warn!("Purged {} pending operations of {}", purged, ctx.collection());
        emitter.refreshed(purged);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

/// Drop every cached record, query result and queued write of the
/// collection without touching the network.
///
/// Emits the number of queued writes dropped.
pub(crate) fn execute_clear(ctx: OperationContext) -> Response<usize> {
    launch(Request::new(), move |emitter| async move {
        let request = emitter.request().clone();
        let _replay = ctx.queue.lock_replay().await;
        request
            .while_live(|| tolerate_corrupt(ctx.cache.clear()))
            .unwrap_or(Err(Error::Cancelled))?;
        let dropped = ctx.queue.clear(None).await?;

        warn!("Cleared {} with {} pending operations", ctx.collection(), dropped);
        emitter.cached(dropped);
        Ok(())
    })
}

/// Replace the cached copy of `id` by the server's.
fn refetch(ctx: OperationContext, id: String) -> Response<()> {
    launch(Request::new(), move |emitter| async move {
        restore(&ctx, &id, emitter.request()).await?;
        emitter.refreshed(());
        Ok(())
    })
}

async fn restore(ctx: &OperationContext, id: &str, request: &Request) -> Result<()> {
    let restored = match ctx.send(&ctx.factory.get_by_id(id), &request.token()).await {
        Ok(response) => {
            let mut record = response.into_record()?;
            record.mark_received(Utc::now());
            request.while_live(|| tolerate_corrupt(ctx.cache.put(record)))
        }
        Err(Error::NotFound(_)) => {
            debug!("{} is gone server-side", id);
            request.while_live(|| {
                tolerate_corrupt(ctx.cache.remove(id))?;
                tolerate_corrupt(ctx.cache.forget_delta(id))
            })
        }
        Err(e) => return Err(e),
    };
    restored.unwrap_or(Err(Error::Cancelled))
}
