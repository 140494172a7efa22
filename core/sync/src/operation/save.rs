//! Record saves.

use chrono::Utc;
use tracing::{debug, warn};

use offsync_common::{is_temp_id, Record, Result};

use super::push::replay_now;
use super::{tolerate_corrupt, OperationContext};
use crate::completion::{launch, Emitter, Response};
use crate::config::WritePolicy;
use crate::queue::{ChangeType, PendingOperation};
use crate::request::Request;

/// Save a record under `policy`.
///
/// - `ForceNetwork`: `Refreshed` with the server copy; the cache is only
///   written after the backend accepted the record
/// - `ForceLocal`: `Cached` with the local copy, then the write is queued
/// - `LocalThenNetwork`: as `ForceLocal`, then the write is replayed at
///   once; on success the server copy follows as `Refreshed`, on failure
///   the write stays queued and the save still succeeds
pub(crate) fn execute_save(
    ctx: OperationContext,
    record: Record,
    policy: WritePolicy,
) -> Response<Record> {
    launch(Request::new(), move |emitter| async move {
        match policy {
            WritePolicy::ForceNetwork => save_remote(&ctx, record, &emitter).await,
            WritePolicy::ForceLocal => save_local(&ctx, record, &emitter).await.map(|_| ()),
            WritePolicy::LocalThenNetwork => {
                let Some(op) = save_local(&ctx, record, &emitter).await? else {
                    return Ok(());
                };
                match replay_now(&ctx, &op, emitter.request()).await {
                    Ok(Some(report)) => match (report.first_error, report.committed) {
                        (Some(err), _) => warn!("Save left queued: {}", err),
                        (None, Some(committed)) => {
                            emitter.refreshed(committed);
                        }
                        (None, None) => {}
                    },
                    Ok(None) => debug!("Save queued behind earlier query-wide writes"),
                    Err(e) => warn!("Save left queued: {}", e),
                }
                Ok(())
            }
        }
    })
}

async fn save_remote(
    ctx: &OperationContext,
    record: Record,
    emitter: &Emitter<Record>,
) -> Result<()> {
    let token = emitter.request().token();
    let mut saved = ctx
        .send(&ctx.factory.save(&record), &token)
        .await?
        .into_record()?;
    saved.mark_received(Utc::now());

    // The backend has the record now; a queued create would duplicate it.
    let temp_id = record.id().filter(|id| is_temp_id(id));
    if let Some(temp_id) = temp_id {
        ctx.queue.clear(Some(temp_id)).await?;
    }

    let stored = emitter.request().while_live(|| match temp_id {
        Some(temp_id) => tolerate_corrupt(ctx.cache.rekey(temp_id, saved.clone())),
        None => tolerate_corrupt(ctx.cache.put(saved.clone())),
    });
    if let Some(result) = stored {
        result?;
        emitter.refreshed(saved);
    }
    Ok(())
}

/// Write locally and queue the write. Returns the queued operation.
async fn save_local(
    ctx: &OperationContext,
    mut record: Record,
    emitter: &Emitter<Record>,
) -> Result<Option<PendingOperation>> {
    let id = record.ensure_id();
    record.metadata.last_received_at = None;

    tolerate_corrupt(ctx.cache.put(record.clone()))?;
    emitter.cached(record.clone());

    let change = if is_temp_id(&id) {
        ChangeType::Create
    } else {
        ChangeType::Update
    };
    let op = ctx
        .queue
        .enqueue(Some(&id), change, ctx.factory.save(&record))
        .await?;
    debug!("Queued {:?} of {} in {}", change, id, ctx.collection());
    Ok(op)
}
