//! Replay of the pending queue.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use offsync_common::{is_temp_id, Error, Metadata, Record, Result};

use super::{tolerate_corrupt, OperationContext};
use crate::completion::{launch, Response};
use crate::conflict::Resolution;
use crate::queue::{ChangeType, PendingOperation};
use crate::request::Request;

/// Summary of one push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    /// Operations the backend acknowledged.
    pub pushed: usize,
    /// Operations dropped because the server copy won a conflict.
    pub dropped: usize,
    /// Records whose queued write lost a conflict.
    pub conflicts: Vec<String>,
    /// Operations left queued after a failure.
    pub failures: Vec<PushFailure>,
}

impl PushOutcome {
    /// Whether every replayed operation left the queue.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn merge(&mut self, other: PushOutcome) {
        self.pushed += other.pushed;
        self.dropped += other.dropped;
        self.conflicts.extend(other.conflicts);
        self.failures.extend(other.failures);
    }
}

/// An operation that stayed queued.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFailure {
    /// Queue position of the operation.
    pub sequence: u64,
    /// Record it targets, `None` for a query-wide write.
    pub object_id: Option<String>,
    /// What went wrong.
    pub message: String,
}

/// Result of replaying the operations of one record.
#[derive(Default)]
pub(crate) struct GroupReport {
    pub(crate) outcome: PushOutcome,
    pub(crate) first_error: Option<Error>,
    /// Last server copy acknowledged in the group.
    pub(crate) committed: Option<Record>,
    cancelled: bool,
}

impl GroupReport {
    fn fail(&mut self, op: &PendingOperation, err: Error) {
        warn!(
            "Replay of operation {} on {:?} failed: {}",
            op.sequence, op.object_id, err
        );
        self.outcome.failures.push(PushFailure {
            sequence: op.sequence,
            object_id: op.object_id.clone(),
            message: err.to_string(),
        });
        self.first_error.get_or_insert(err);
    }

    fn merge(&mut self, other: GroupReport) {
        self.outcome.merge(other.outcome);
        if self.first_error.is_none() {
            self.first_error = other.first_error;
        }
        self.committed = other.committed.or(self.committed.take());
        self.cancelled |= other.cancelled;
    }
}

/// Replay every queued operation of the collection.
///
/// Operations of one record replay strictly in order, one at a time;
/// distinct records replay concurrently up to the configured fan-out. A
/// query-wide operation is a barrier: everything queued before it finishes
/// first, everything after it waits.
///
/// A failure keeps the operation and the rest of its record queued while
/// the other records of the same batch proceed. The push then stops at
/// the next barrier: one rejected write leaves every later batch queued,
/// including writes to records unrelated to the rejected one, until a
/// later push gets the rejected write through or it is purged.
///
/// Emits the [`PushOutcome`], then fails with the first error if any
/// operation stayed queued.
pub(crate) fn execute_push(ctx: OperationContext) -> Response<PushOutcome> {
    launch(Request::new(), move |emitter| async move {
        let request = emitter.request().clone();
        let _replay = ctx.queue.lock_replay().await;
        let ops = ctx.queue.list(None).await?;
        if ops.is_empty() {
            debug!("Nothing to push for {}", ctx.collection());
            emitter.refreshed(PushOutcome::default());
            return Ok(());
        }
        info!("Pushing {} pending operations of {}", ops.len(), ctx.collection());

        let fan_out = ctx.config.push_fan_out.max(1);
        let mut total = GroupReport::default();
        for batch in batches(ops) {
            if request.is_cancelled() || total.first_error.is_some() {
                break;
            }
            match batch {
                Batch::Barrier(op) => total.merge(replay_group(&ctx, vec![op], &request).await),
                Batch::Records(groups) => {
                    let reports: Vec<GroupReport> = stream::iter(groups)
                        .map(|group| replay_group(&ctx, group, &request))
                        .buffer_unordered(fan_out)
                        .collect()
                        .await;
                    for report in reports {
                        total.merge(report);
                    }
                }
            }
        }
        if total.cancelled || request.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let GroupReport {
            outcome,
            first_error,
            ..
        } = total;
        info!(
            "Push of {} finished: {} pushed, {} dropped, {} failed",
            ctx.collection(),
            outcome.pushed,
            outcome.dropped,
            outcome.failures.len()
        );
        emitter.refreshed(outcome);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

/// Replay the queued writes of `op`'s record right away.
///
/// Nothing is replayed (`None`) when a query-wide write queued earlier
/// must go first, or when `op` is query-wide and not at the head of the
/// queue.
pub(crate) async fn replay_now(
    ctx: &OperationContext,
    op: &PendingOperation,
    request: &Request,
) -> Result<Option<GroupReport>> {
    let _replay = ctx.queue.lock_replay().await;
    let ops = ctx.queue.list(None).await?;

    let group: Vec<PendingOperation> = match op.object_id.as_deref() {
        Some(id) => {
            let Some(first) = ops.iter().position(|o| o.object_id.as_deref() == Some(id)) else {
                return Ok(None);
            };
            if ops[..first].iter().any(|o| o.object_id.is_none()) {
                return Ok(None);
            }
            ops.into_iter()
                .filter(|o| o.object_id.as_deref() == Some(id))
                .collect()
        }
        None => match ops.into_iter().next() {
            Some(head) if head.sequence == op.sequence => vec![head],
            _ => return Ok(None),
        },
    };
    Ok(Some(replay_group(ctx, group, request).await))
}

enum Batch {
    /// Per-record groups that may replay concurrently.
    Records(Vec<Vec<PendingOperation>>),
    /// A query-wide operation.
    Barrier(PendingOperation),
}

/// Split the queue at query-wide operations and group the rest by record,
/// keeping queue order inside each group.
fn batches(ops: Vec<PendingOperation>) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut groups: Vec<Vec<PendingOperation>> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for op in ops {
        match op.object_id.clone() {
            Some(id) => {
                let slot = *slots.entry(id).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[slot].push(op);
            }
            None => {
                if !groups.is_empty() {
                    batches.push(Batch::Records(std::mem::take(&mut groups)));
                    slots.clear();
                }
                batches.push(Batch::Barrier(op));
            }
        }
    }
    if !groups.is_empty() {
        batches.push(Batch::Records(groups));
    }
    batches
}

/// Replay the operations of one record in order, stopping at the first
/// operation that stays queued.
async fn replay_group(
    ctx: &OperationContext,
    ops: Vec<PendingOperation>,
    request: &Request,
) -> GroupReport {
    let mut report = GroupReport::default();
    let mut ops = VecDeque::from(ops);
    let token = request.token();

    while let Some(op) = ops.pop_front() {
        let sent = match ctx.send(&op.request, &token).await {
            Err(Error::NotFound(_)) if op.change == ChangeType::Delete => Ok(None),
            Err(err) => Err(err),
            Ok(_) if op.change == ChangeType::Delete => Ok(None),
            Ok(response) => response.into_record().map(Some),
        };

        match sent {
            Ok(record) => match acknowledge(ctx, &op, record, request).await {
                Ok(ack) => {
                    report.outcome.pushed += 1;
                    if ack.committed.is_some() {
                        report.committed = ack.committed;
                    }
                    if let Some(follow_up) = ack.follow_up {
                        ops = follow_up.into();
                    }
                }
                Err(err) => {
                    report.fail(&op, err);
                    break;
                }
            },
            Err(Error::Cancelled) => {
                report.cancelled = true;
                break;
            }
            Err(err) => match ctx.resolver.resolve(&op, &err) {
                Resolution::Drop => match drop_conflicted(ctx, &op, request).await {
                    Ok(()) => {
                        report.outcome.dropped += 1;
                        report.outcome.conflicts.extend(op.object_id.clone());
                    }
                    Err(e) => {
                        report.fail(&op, e);
                        break;
                    }
                },
                Resolution::Keep => {
                    report.fail(&op, err);
                    break;
                }
            },
        }
    }
    report
}

#[derive(Default)]
struct Ack {
    committed: Option<Record>,
    /// Operations that now target the committed id and replace the rest
    /// of the group.
    follow_up: Option<Vec<PendingOperation>>,
}

/// Remove an acknowledged operation and bring the cache in line.
///
/// The queue is always updated; the cache only while the request is live.
async fn acknowledge(
    ctx: &OperationContext,
    op: &PendingOperation,
    record: Option<Record>,
    request: &Request,
) -> Result<Ack> {
    ctx.queue.remove(op).await?;
    let now = Utc::now();

    match (op.change, op.object_id.as_deref(), record) {
        (ChangeType::Create, Some(temp_id), Some(mut record)) => {
            let new_id = record.id.clone().ok_or_else(|| {
                Error::Serialization("created record came back without an id".to_string())
            })?;
            record.mark_received(now);
            let moved = ctx.queue.retarget(temp_id, &new_id).await?;

            let Some(local) = tolerate_corrupt(ctx.cache.get(temp_id))? else {
                if !ctx.cache.is_corrupt() {
                    // Removed locally while the create was in flight.
                    debug!("{} vanished before {} was committed", temp_id, new_id);
                    ctx.queue
                        .enqueue(
                            Some(&new_id),
                            ChangeType::Delete,
                            ctx.factory.remove_by_id(&new_id),
                        )
                        .await?;
                }
                return Ok(Ack {
                    committed: None,
                    follow_up: Some(ctx.queue.list(Some(&new_id)).await?),
                });
            };

            // Later local edits are still queued: keep their fields.
            let snapshot = if moved > 0 {
                Record {
                    id: Some(new_id.clone()),
                    fields: local.fields,
                    metadata: Metadata {
                        last_received_at: None,
                        ..record.metadata.clone()
                    },
                }
            } else {
                record.clone()
            };
            request
                .while_live(|| tolerate_corrupt(ctx.cache.rekey(temp_id, snapshot)))
                .unwrap_or(Ok(()))?;
            debug!("Committed {} as {}", temp_id, new_id);

            let follow_up = if moved > 0 {
                Some(ctx.queue.list(Some(&new_id)).await?)
            } else {
                None
            };
            Ok(Ack {
                committed: Some(record),
                follow_up,
            })
        }
        (ChangeType::Update | ChangeType::Create, Some(id), Some(mut record)) => {
            record.mark_received(now);
            if ctx.queue.list(Some(id)).await?.is_empty() {
                request
                    .while_live(|| tolerate_corrupt(ctx.cache.put(record.clone())))
                    .unwrap_or(Ok(()))?;
            }
            Ok(Ack {
                committed: Some(record),
                follow_up: None,
            })
        }
        (_, Some(id), _) => {
            request
                .while_live(|| tolerate_corrupt(ctx.cache.forget_delta(id)))
                .unwrap_or(Ok(()))?;
            Ok(Ack::default())
        }
        _ => Ok(Ack::default()),
    }
}

/// Drop an operation whose record changed server-side and adopt the
/// server copy, unless later local writes are still queued.
async fn drop_conflicted(
    ctx: &OperationContext,
    op: &PendingOperation,
    request: &Request,
) -> Result<()> {
    ctx.queue.remove(op).await?;
    let Some(id) = op.object_id.as_deref() else {
        return Ok(());
    };
    if is_temp_id(id) || !ctx.queue.list(Some(id)).await?.is_empty() {
        return Ok(());
    }

    match ctx.send(&ctx.factory.get_by_id(id), &request.token()).await {
        Ok(response) => {
            let mut record = response.into_record()?;
            record.mark_received(Utc::now());
            request
                .while_live(|| tolerate_corrupt(ctx.cache.put(record)))
                .unwrap_or(Ok(()))?;
        }
        Err(Error::NotFound(_)) => {
            request
                .while_live(|| tolerate_corrupt(ctx.cache.remove(id)).map(|_| ()))
                .unwrap_or(Ok(()))?;
        }
        Err(e) => warn!("Could not refetch {} after a conflict: {}", id, e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_common::{CollectionName, Query};
    use offsync_gateway::RequestFactory;

    fn op(sequence: u64, id: Option<&str>) -> PendingOperation {
        let factory = RequestFactory::new(CollectionName::new("books").unwrap());
        let (change, request) = match id {
            Some(id) => (ChangeType::Update, factory.save(&Record::with_id(id))),
            None => (ChangeType::Delete, factory.remove_by_query(&Query::all())),
        };
        PendingOperation {
            sequence,
            collection: "books".to_string(),
            object_id: id.map(str::to_string),
            change,
            request,
            enqueued_at: Utc::now(),
        }
    }

    fn sequences(group: &[PendingOperation]) -> Vec<u64> {
        group.iter().map(|op| op.sequence).collect()
    }

    #[test]
    fn test_batches_group_by_record() {
        let batches = batches(vec![
            op(1, Some("a")),
            op(2, Some("b")),
            op(3, Some("a")),
        ]);
        assert_eq!(batches.len(), 1);
        let Batch::Records(groups) = &batches[0] else {
            panic!("expected record groups");
        };
        assert_eq!(sequences(&groups[0]), vec![1, 3]);
        assert_eq!(sequences(&groups[1]), vec![2]);
    }

    #[test]
    fn test_query_wide_operation_is_a_barrier() {
        let batches = batches(vec![
            op(1, Some("a")),
            op(2, None),
            op(3, Some("a")),
            op(4, None),
        ]);
        assert_eq!(batches.len(), 4);
        assert!(matches!(&batches[0], Batch::Records(g) if sequences(&g[0]) == vec![1]));
        assert!(matches!(&batches[1], Batch::Barrier(op) if op.sequence == 2));
        assert!(matches!(&batches[2], Batch::Records(g) if sequences(&g[0]) == vec![3]));
        assert!(matches!(&batches[3], Batch::Barrier(op) if op.sequence == 4));
    }

    #[test]
    fn test_outcome_merge() {
        let mut total = PushOutcome {
            pushed: 1,
            ..PushOutcome::default()
        };
        total.merge(PushOutcome {
            pushed: 2,
            dropped: 1,
            conflicts: vec!["a".to_string()],
            failures: vec![PushFailure {
                sequence: 7,
                object_id: None,
                message: "offline".to_string(),
            }],
        });
        assert_eq!(total.pushed, 3);
        assert_eq!(total.dropped, 1);
        assert!(!total.is_clean());
    }
}
