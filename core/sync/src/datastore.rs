//! The per-collection entry point used by applications.

use tokio::task::JoinHandle;
use tracing::debug;

use offsync_common::{CollectionName, Error, Query, Record, Result};

use crate::completion::{launch, Response};
use crate::config::{DataStoreConfig, ReadPolicy, WritePolicy};
use crate::operation::{
    execute_clear, execute_purge, execute_push, execute_read, execute_remove, execute_save,
    run_read, CountOperation, FindOperation, GetOperation, OperationContext, PushOutcome,
    RemoveTarget,
};
use crate::queue::PendingOperation;
use crate::request::{MultiRequest, Request};
use crate::scheduler::SyncScheduler;

/// Reads, writes and sync of one collection.
///
/// Cheap to clone; clones share the collection's cache and queue. Every
/// call returns at once with a [`Response`] and runs in the background,
/// so a tokio runtime must be running.
#[derive(Clone)]
pub struct DataStore {
    ctx: OperationContext,
}

impl DataStore {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }

    /// The collection this store reads and writes.
    pub fn collection(&self) -> &CollectionName {
        self.ctx.collection()
    }

    /// The store's settings.
    pub fn config(&self) -> &DataStoreConfig {
        &self.ctx.config
    }

    /// Records matching `query`.
    ///
    /// With `Both`, a fresh cached result arrives first as `Cached`, and a
    /// differing network result follows as `Refreshed`.
    pub fn find(&self, query: Query, policy: ReadPolicy) -> Response<Vec<Record>> {
        let op = FindOperation::new(query, self.ctx.config.delta_set);
        execute_read(op, self.ctx.clone(), policy)
    }

    /// One record, or `None` when a local read misses.
    pub fn get(&self, id: &str, policy: ReadPolicy) -> Response<Option<Record>> {
        execute_read(GetOperation::new(id), self.ctx.clone(), policy)
    }

    /// Like [`get`](Self::get), but a local miss fails with `NotFoundLocally`.
    pub fn get_required(&self, id: &str, policy: ReadPolicy) -> Response<Option<Record>> {
        execute_read(GetOperation::new(id).required(), self.ctx.clone(), policy)
    }

    /// Number of records matching `query`.
    pub fn count(&self, query: Query, policy: ReadPolicy) -> Response<u64> {
        execute_read(CountOperation::new(query), self.ctx.clone(), policy)
    }

    /// Create or replace a record. Records without an id get a temporary
    /// one until the backend assigns theirs.
    pub fn save(&self, record: Record, policy: WritePolicy) -> Response<Record> {
        execute_save(self.ctx.clone(), record, policy)
    }

    /// Remove one record or every record a query matches.
    pub fn remove(&self, target: impl Into<RemoveTarget>, policy: WritePolicy) -> Response<u64> {
        execute_remove(self.ctx.clone(), target.into(), policy)
    }

    /// Replay queued writes against the backend.
    pub fn push(&self) -> Response<PushOutcome> {
        execute_push(self.ctx.clone())
    }

    /// Drop every queued write without replaying it.
    ///
    /// Records the dropped writes touched are refetched, so the cache ends
    /// up holding the server's copies.
    pub fn purge(&self) -> Response<usize> {
        execute_purge(self.ctx.clone())
    }

    /// Forget the collection: every cached record, cached query result and
    /// queued write is dropped, and nothing is refetched.
    pub fn clear_cache(&self) -> Response<usize> {
        execute_clear(self.ctx.clone())
    }

    /// Replace the cached result of `query` with the backend's.
    ///
    /// Cached records that match an unbounded query but are gone remotely
    /// are dropped.
    ///
    /// # Errors
    /// - `PendingOperations` while writes are queued; push or purge first
    pub fn pull(&self, query: Query) -> Response<Vec<Record>> {
        let ctx = self.ctx.clone();
        let find = FindOperation::new(query, false).pruning();
        launch(Request::new(), move |emitter| async move {
            let pending = ctx.queue.count().await?;
            if pending > 0 {
                return Err(Error::PendingOperations(pending));
            }
            run_read(&find, &ctx, ReadPolicy::NetworkOnly, &emitter).await
        })
    }

    /// Push, then pull `query` if every queued write went through.
    ///
    /// Both steps belong to one request: cancelling it cancels whichever
    /// is running.
    pub fn sync(&self, query: Query) -> Response<Vec<Record>> {
        let multi = MultiRequest::new();
        let store = self.clone();
        launch(multi.request().clone(), move |emitter| async move {
            let push = store.push();
            multi.add(push.request().clone())?;
            let outcome = push.value().await?;
            debug!("Sync of {} pushed {} writes", store.collection(), outcome.pushed);

            let pull = store.pull(query);
            multi.add(pull.request().clone())?;
            multi.close();
            let records = pull.value().await?;
            emitter.refreshed(records);
            Ok(())
        })
    }

    /// Number of queued writes.
    pub async fn pending_count(&self) -> Result<usize> {
        self.ctx.queue.count().await
    }

    /// The queued writes, in replay order.
    pub async fn pending(&self) -> Result<Vec<PendingOperation>> {
        self.ctx.queue.list(None).await
    }

    /// Start pushing in the background according to the configured sync
    /// mode. Manual mode only pushes on [`SyncScheduler::request_push`].
    pub fn spawn_scheduler(&self) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(self.ctx.config.sync_mode.clone());
        let store = self.clone();
        let task = tokio::spawn(handle.run(move || store.push().value()));
        (scheduler, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Event;
    use crate::config::DataStoreConfig;
    use crate::engine::SyncEngine;
    use offsync_common::StatusCategory;
    use offsync_gateway::MemoryGateway;
    use offsync_storage::{DurableStore, MemoryStore, SqliteStore};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup(config: DataStoreConfig) -> (DataStore, MemoryGateway, Arc<MemoryStore>) {
        let gateway = MemoryGateway::with_id_prefix("x");
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(store.clone(), Arc::new(gateway.clone()));
        let books = engine.data_store_with("books", config).await.unwrap();
        (books, gateway, store)
    }

    fn fresh() -> DataStoreConfig {
        DataStoreConfig::default().with_ttl(Duration::from_secs(60))
    }

    fn title(record: &Record) -> &str {
        record.get("title").and_then(|v| v.as_str()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_local_save_then_push_commits_record() {
        let (books, gateway, _) = setup(fresh()).await;

        let local = books
            .save(Record::new().field("name", "a"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        assert!(local.is_local_only());
        assert_eq!(books.pending_count().await.unwrap(), 1);
        assert_eq!(gateway.len("books"), 0);

        let outcome = books.push().value().await.unwrap();
        assert_eq!(outcome.pushed, 1);
        assert!(outcome.is_clean());
        assert_eq!(books.pending_count().await.unwrap(), 0);

        let committed = books
            .get("x1", ReadPolicy::LocalOnly)
            .value()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(committed.get("name"), Some(&"a".into()));
        let temp_id = local.id().unwrap();
        let gone = books.get(temp_id, ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_push_replays_in_queue_order() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1")).unwrap();

        for version in ["v1", "v2"] {
            books
                .save(Record::with_id("b1").field("title", version), WritePolicy::ForceLocal)
                .value()
                .await
                .unwrap();
        }
        assert_eq!(books.pending_count().await.unwrap(), 2);

        let outcome = books.push().value().await.unwrap();
        assert_eq!(outcome.pushed, 2);
        assert_eq!(title(&gateway.record("books", "b1").unwrap()), "v2");

        let puts: Vec<String> = gateway
            .requests()
            .iter()
            .filter_map(|r| r.body.as_ref()?.get("title")?.as_str().map(str::to_string))
            .collect();
        assert_eq!(puts, vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_creates_then_update_of_new_record() {
        let (books, gateway, _) = setup(fresh()).await;

        let draft = books
            .save(Record::new().field("title", "draft"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        let mut edited = draft.clone();
        edited.set("title", "final").unwrap();
        books.save(edited, WritePolicy::ForceLocal).value().await.unwrap();
        // Coalesced into one create.
        assert_eq!(books.pending_count().await.unwrap(), 1);

        books.push().value().await.unwrap();
        assert_eq!(gateway.len("books"), 1);
        assert_eq!(title(&gateway.record("books", "x1").unwrap()), "final");
    }

    #[tokio::test]
    async fn test_both_delivers_cached_then_refreshed() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "one")).unwrap();

        let first = books.find(Query::all(), ReadPolicy::Both).collect().await;
        assert!(matches!(first.as_slice(), [Event::Refreshed(r), Event::Done] if r.len() == 1));

        gateway.insert("books", Record::with_id("b2").field("title", "two")).unwrap();
        let second = books.find(Query::all(), ReadPolicy::Both).collect().await;
        match second.as_slice() {
            [Event::Cached(cached), Event::Refreshed(refreshed), Event::Done] => {
                assert_eq!(cached.len(), 1);
                assert_eq!(refreshed.len(), 2);
            }
            other => panic!("unexpected events: {:?}", other.len()),
        }

        // Nothing changed: the refresh stays silent.
        let third = books.find(Query::all(), ReadPolicy::Both).collect().await;
        assert!(matches!(third.as_slice(), [Event::Cached(r), Event::Done] if r.len() == 2));
    }

    #[tokio::test]
    async fn test_both_without_fresh_cache_reads_network() {
        let (books, gateway, _) = setup(DataStoreConfig::default()).await;
        gateway.insert("books", Record::with_id("b1")).unwrap();

        books.find(Query::all(), ReadPolicy::Both).value().await.unwrap();
        // ttl 0: the cached result is never fresh.
        let events = books.find(Query::all(), ReadPolicy::Both).collect().await;
        assert!(matches!(events.as_slice(), [Event::Refreshed(_), Event::Done]));
    }

    #[tokio::test]
    async fn test_local_only_find_on_empty_cache() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1")).unwrap();

        let events = books.find(Query::all(), ReadPolicy::LocalOnly).collect().await;
        assert!(matches!(events.as_slice(), [Event::Cached(r), Event::Done] if r.is_empty()));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_local_only_get_required_misses() {
        let (books, _, _) = setup(fresh()).await;
        let err = books
            .get_required("b1", ReadPolicy::LocalOnly)
            .value()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFoundLocally(_)));
    }

    #[tokio::test]
    async fn test_get_of_deleted_record_clears_cache() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1")).unwrap();
        books.get("b1", ReadPolicy::NetworkOnly).value().await.unwrap();

        gateway.delete("books", "b1");
        let err = books.get("b1", ReadPolicy::NetworkOnly).value().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let cached = books.get("b1", ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_network_find_keeps_pending_local_edits() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "server")).unwrap();
        gateway.set_offline(true);
        books
            .save(Record::with_id("b1").field("title", "mine"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        gateway.set_offline(false);

        let records = books.find(Query::all(), ReadPolicy::NetworkOnly).value().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(title(&records[0]), "mine");
    }

    #[tokio::test]
    async fn test_delta_find_fetches_only_changes() {
        let (books, gateway, _) = setup(DataStoreConfig::default().with_delta_set(true)).await;
        gateway.insert("books", Record::with_id("a").field("title", "A")).unwrap();
        gateway.insert("books", Record::with_id("b").field("title", "B")).unwrap();
        gateway.insert("books", Record::with_id("c").field("title", "C")).unwrap();

        let first = books.find(Query::all(), ReadPolicy::NetworkOnly).value().await.unwrap();
        assert_eq!(first.len(), 3);

        gateway.insert("books", Record::with_id("b").field("title", "B2")).unwrap();
        gateway.delete("books", "c");
        let before = gateway.requests().len();

        let second = books.find(Query::all(), ReadPolicy::NetworkOnly).value().await.unwrap();
        let titles: Vec<&str> = second.iter().map(title).collect();
        assert_eq!(titles, vec!["A", "B2"]);

        // One projection request, one fetch of the changed record.
        let requests = gateway.requests();
        assert_eq!(requests.len() - before, 2);
        let cached = books.get("c", ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_conflict_adopts_server_copy() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "server")).unwrap();
        books
            .save(Record::with_id("b1").field("title", "mine"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        gateway.reject_next(409, "modified since");
        let outcome = books.push().value().await.unwrap();
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.conflicts, vec!["b1".to_string()]);
        assert_eq!(books.pending_count().await.unwrap(), 0);

        let cached = books
            .get("b1", ReadPolicy::LocalOnly)
            .value()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(title(&cached), "server");
    }

    #[tokio::test]
    async fn test_failed_push_keeps_operation_queued() {
        let (books, gateway, _) = setup(fresh()).await;
        books
            .save(Record::new().field("title", "draft"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        gateway.set_offline(true);
        let events = books.push().collect().await;
        match events.as_slice() {
            [Event::Refreshed(outcome), Event::Failed(Error::NetworkUnreachable(_))] => {
                assert_eq!(outcome.failures.len(), 1);
            }
            other => panic!("unexpected events: {}", other.len()),
        }
        assert_eq!(books.pending_count().await.unwrap(), 1);

        gateway.set_offline(false);
        books.push().value().await.unwrap();
        assert_eq!(books.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_then_network_save() {
        let (books, gateway, _) = setup(fresh()).await;

        let events = books
            .save(Record::new().field("title", "now"), WritePolicy::LocalThenNetwork)
            .collect()
            .await;
        match events.as_slice() {
            [Event::Cached(local), Event::Refreshed(committed), Event::Done] => {
                assert!(local.is_local_only());
                assert_eq!(committed.id(), Some("x1"));
            }
            other => panic!("unexpected events: {}", other.len()),
        }
        assert_eq!(books.pending_count().await.unwrap(), 0);

        // Offline: the save still succeeds and stays queued.
        gateway.set_offline(true);
        let saved = books
            .save(Record::new().field("title", "later"), WritePolicy::LocalThenNetwork)
            .value()
            .await
            .unwrap();
        assert!(saved.is_local_only());
        assert_eq!(books.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_network_save_needs_backend() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.set_offline(true);
        let err = books
            .save(Record::new(), WritePolicy::ForceNetwork)
            .value()
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(books.pending_count().await.unwrap(), 0);
        let cached = books.find(Query::all(), ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn test_remove_local_record_never_reaches_backend() {
        let (books, gateway, _) = setup(fresh()).await;
        let draft = books
            .save(Record::new(), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        let removed = books
            .remove(draft.id().unwrap(), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(books.pending_count().await.unwrap(), 0);
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_by_query_over_network() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("a").field("n", 1)).unwrap();
        gateway.insert("books", Record::with_id("b").field("n", 2)).unwrap();
        books.find(Query::all(), ReadPolicy::NetworkOnly).value().await.unwrap();

        let query = Query::all().op("n", "$gt", 1);
        let removed = books
            .remove(query, WritePolicy::ForceNetwork)
            .value()
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(gateway.len("books"), 1);
        let left = books.find(Query::all(), ReadPolicy::LocalOnly).value().await.unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_record_counts_zero() {
        let (books, _, _) = setup(fresh()).await;
        let removed = books
            .remove("nope", WritePolicy::ForceNetwork)
            .value()
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_count_policies() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("a")).unwrap();
        gateway.insert("books", Record::with_id("b")).unwrap();

        let remote = books.count(Query::all(), ReadPolicy::NetworkOnly).value().await.unwrap();
        assert_eq!(remote, 2);
        let local = books.count(Query::all(), ReadPolicy::LocalOnly).value().await.unwrap();
        assert_eq!(local, 0);
    }

    #[tokio::test]
    async fn test_pull_refuses_while_pending() {
        let (books, _, _) = setup(fresh()).await;
        books.save(Record::new(), WritePolicy::ForceLocal).value().await.unwrap();

        let err = books.pull(Query::all()).value().await.unwrap_err();
        assert!(matches!(err, Error::PendingOperations(1)));
    }

    #[tokio::test]
    async fn test_pull_prunes_deleted_records() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("a")).unwrap();
        gateway.insert("books", Record::with_id("b")).unwrap();
        books.pull(Query::all()).value().await.unwrap();

        gateway.delete("books", "b");
        let records = books.pull(Query::all()).value().await.unwrap();
        assert_eq!(records.len(), 1);
        let local = books.get("b", ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(local.is_none());
    }

    #[tokio::test]
    async fn test_sync_pushes_then_pulls() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1")).unwrap();
        books
            .save(Record::new().field("title", "new"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        let records = books.sync(Query::all()).value().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(books.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_stops_when_push_fails() {
        let (books, gateway, _) = setup(fresh()).await;
        books.save(Record::new(), WritePolicy::ForceLocal).value().await.unwrap();
        gateway.set_offline(true);

        let err = books.sync(Query::all()).value().await.unwrap_err();
        assert!(matches!(err, Error::NetworkUnreachable(_)));
        assert_eq!(books.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_local_creates() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "server")).unwrap();
        books.save(Record::new(), WritePolicy::ForceLocal).value().await.unwrap();
        books
            .save(Record::with_id("b1").field("title", "edit"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        let purged = books.purge().value().await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(books.pending_count().await.unwrap(), 0);
        let local = books.find(Query::all(), ReadPolicy::LocalOnly).value().await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id(), Some("b1"));
        assert_eq!(title(&local[0]), "server");
        // One refetch of b1, nothing replayed.
        assert_eq!(gateway.calls(), 1);
        assert_eq!(title(&gateway.record("books", "b1").unwrap()), "server");
    }

    #[tokio::test]
    async fn test_purge_restores_locally_removed_record() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "server")).unwrap();
        books.get("b1", ReadPolicy::NetworkOnly).value().await.unwrap();
        books
            .save(Record::with_id("b1").field("title", "mine"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        books.remove("b1", WritePolicy::ForceLocal).value().await.unwrap();
        let removed = books.get("b1", ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(removed.is_none());

        books.purge().value().await.unwrap();
        assert_eq!(books.pending_count().await.unwrap(), 0);
        let restored = books
            .get("b1", ReadPolicy::LocalOnly)
            .value()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(title(&restored), "server");
    }

    #[tokio::test]
    async fn test_purge_evicts_record_gone_remotely() {
        let (books, _gateway, _) = setup(fresh()).await;
        books
            .save(Record::with_id("b1").field("title", "mine"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        assert_eq!(books.purge().value().await.unwrap(), 1);
        let cached = books.get("b1", ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_purge_keeps_write_it_cannot_refetch() {
        let (books, gateway, _) = setup(fresh()).await;
        books.save(Record::new(), WritePolicy::ForceLocal).value().await.unwrap();
        books
            .save(Record::with_id("b1").field("title", "mine"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        gateway.set_offline(true);
        let events = books.purge().collect().await;
        assert!(matches!(
            events.as_slice(),
            [Event::Refreshed(1), Event::Failed(Error::NetworkUnreachable(_))]
        ));
        let pending = books.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].object_id.as_deref(), Some("b1"));
        let kept = books
            .get("b1", ReadPolicy::LocalOnly)
            .value()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(title(&kept), "mine");
    }

    #[tokio::test]
    async fn test_clear_cache_forgets_collection() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "one")).unwrap();
        books.find(Query::all(), ReadPolicy::Both).value().await.unwrap();
        books
            .save(Record::new().field("title", "draft"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        assert_eq!(books.clear_cache().value().await.unwrap(), 1);
        assert_eq!(books.pending_count().await.unwrap(), 0);
        let local = books.find(Query::all(), ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(local.is_empty());
        // Only the initial find went out.
        assert_eq!(gateway.calls(), 1);
        assert_eq!(gateway.len("books"), 1);
    }

    #[tokio::test]
    async fn test_push_partial_failure_keeps_rejected_write() {
        let (books, gateway, _) = setup(fresh().with_push_fan_out(1)).await;
        for id in ["a", "b"] {
            gateway.insert("books", Record::with_id(id).field("title", "old")).unwrap();
            books
                .save(Record::with_id(id).field("title", "new"), WritePolicy::ForceLocal)
                .value()
                .await
                .unwrap();
        }

        gateway.reject_next(400, "bad title");
        let events = books.push().collect().await;
        match events.as_slice() {
            [
                Event::Refreshed(outcome),
                Event::Failed(Error::ServerRejected {
                    status: StatusCategory::ClientError(400),
                    ..
                }),
            ] => {
                assert_eq!(outcome.pushed, 1);
                assert_eq!(outcome.failures.len(), 1);
                assert_eq!(outcome.failures[0].object_id.as_deref(), Some("a"));
            }
            other => panic!("unexpected events: {}", other.len()),
        }
        assert_eq!(title(&gateway.record("books", "b").unwrap()), "new");
        assert_eq!(title(&gateway.record("books", "a").unwrap()), "old");
        let pending = books.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].object_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rejection_blocks_later_batches() {
        let (books, gateway, _) = setup(fresh()).await;
        for id in ["a", "b"] {
            gateway.insert("books", Record::with_id(id).field("title", "old")).unwrap();
        }
        books
            .save(Record::with_id("a").field("title", "new"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        books
            .remove(Query::all().eq("title", "none"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();
        books
            .save(Record::with_id("b").field("title", "new"), WritePolicy::ForceLocal)
            .value()
            .await
            .unwrap();

        gateway.reject_next(400, "bad title");
        let events = books.push().collect().await;
        match events.as_slice() {
            [Event::Refreshed(outcome), Event::Failed(Error::ServerRejected { .. })] => {
                assert_eq!(outcome.pushed, 0);
            }
            other => panic!("unexpected events: {}", other.len()),
        }
        assert_eq!(books.pending_count().await.unwrap(), 3);
        assert_eq!(title(&gateway.record("books", "b").unwrap()), "old");
    }

    #[tokio::test]
    async fn test_unbounded_ttl_keeps_cache_fresh() {
        let (books, gateway, _) = setup(DataStoreConfig::default().with_ttl(Duration::MAX)).await;
        assert_eq!(books.config().ttl, u64::MAX);
        gateway.insert("books", Record::with_id("b1").field("title", "one")).unwrap();

        let first = books.find(Query::all(), ReadPolicy::Both).collect().await;
        assert!(matches!(first.as_slice(), [Event::Refreshed(r), Event::Done] if r.len() == 1));
        let second = books.find(Query::all(), ReadPolicy::Both).collect().await;
        assert!(matches!(second.as_slice(), [Event::Cached(r), Event::Done] if r.len() == 1));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.set_latency(Some(Duration::from_secs(30)));

        let response = books.find(Query::all(), ReadPolicy::NetworkOnly);
        response.cancel();
        response.cancel();
        let events = response.collect().await;
        assert!(matches!(events.as_slice(), [Event::Cancelled]));
    }

    #[tokio::test]
    async fn test_cancelled_read_leaves_cache_untouched() {
        let (books, gateway, _) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1")).unwrap();
        gateway.set_latency(Some(Duration::from_millis(50)));

        let response = books.get("b1", ReadPolicy::NetworkOnly);
        tokio::time::sleep(Duration::from_millis(10)).await;
        response.cancel();
        assert!(matches!(response.value().await, Err(Error::Cancelled)));

        let cached = books.get("b1", ReadPolicy::LocalOnly).value().await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_network() {
        let (books, gateway, store) = setup(fresh()).await;
        gateway.insert("books", Record::with_id("b1").field("title", "remote")).unwrap();
        store.put("records/books", "b1", b"not json".to_vec()).unwrap();

        let record = books
            .get("b1", ReadPolicy::Both)
            .value()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(title(&record), "remote");

        // Local reads are answered by the network from now on.
        let events = books.find(Query::all(), ReadPolicy::LocalOnly).collect().await;
        assert!(matches!(events.as_slice(), [Event::Refreshed(r), Event::Done] if r.len() == 1));
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsync.db");
        let gateway = MemoryGateway::with_id_prefix("x");

        {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let engine = SyncEngine::new(store, Arc::new(gateway.clone()));
            let books = engine.data_store("books").await.unwrap();
            books
                .save(Record::new().field("title", "offline"), WritePolicy::ForceLocal)
                .value()
                .await
                .unwrap();
        }

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = SyncEngine::new(store, Arc::new(gateway.clone()));
        let books = engine.data_store("books").await.unwrap();
        assert_eq!(books.pending_count().await.unwrap(), 1);

        books.push().value().await.unwrap();
        assert_eq!(title(&gateway.record("books", "x1").unwrap()), "offline");
    }

    #[tokio::test]
    async fn test_scheduler_pushes_on_request() {
        let (books, gateway, _) = setup(fresh()).await;
        books.save(Record::new(), WritePolicy::ForceLocal).value().await.unwrap();

        let (scheduler, task) = books.spawn_scheduler();
        scheduler.request_push().await.unwrap();
        scheduler.shutdown().await;
        task.await.unwrap();

        assert_eq!(gateway.len("books"), 1);
        assert_eq!(books.pending_count().await.unwrap(), 0);
    }
}
