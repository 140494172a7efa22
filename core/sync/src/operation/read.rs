//! The shared read pipeline.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use offsync_common::{Error, Result, Snapshot};

use super::OperationContext;
use crate::completion::{launch, Emitter, Response};
use crate::config::ReadPolicy;
use crate::request::Request;

/// One kind of read: where its data lives locally and how to fetch it.
#[async_trait]
pub(crate) trait ReadOperation: Send + Sync + 'static {
    /// What the caller receives.
    type Output: Snapshot + Clone + Send + 'static;
    /// Raw network result, before it is applied to the cache.
    type Fetched: Send + 'static;

    /// A fresh cache hit, or `None` when the network must be asked.
    fn read_cached(&self, ctx: &OperationContext) -> Result<Option<Self::Output>>;

    /// The answer of a cache-only read.
    fn read_local(&self, ctx: &OperationContext) -> Result<Self::Output>;

    /// Ask the backend.
    async fn fetch(
        &self,
        ctx: &OperationContext,
        token: &CancellationToken,
    ) -> Result<Self::Fetched>;

    /// Store a fetched result and produce the caller's value.
    ///
    /// Runs only while the request is live; a corrupt cache must not fail
    /// the read.
    fn apply(&self, ctx: &OperationContext, fetched: Self::Fetched) -> Result<Self::Output>;
}

/// Run a read under `policy`.
///
/// - `NetworkOnly`: one `Refreshed` value
/// - `LocalOnly`: one `Cached` value
/// - `Both`: `Cached` for a fresh hit, then `Refreshed` only if the network
///   value differs; without a fresh hit, like `NetworkOnly`
///
/// A corrupt cache turns every policy into `NetworkOnly`.
pub(crate) fn execute_read<O: ReadOperation>(
    op: O,
    ctx: OperationContext,
    policy: ReadPolicy,
) -> Response<O::Output> {
    launch(Request::new(), move |emitter| async move {
        run_read(&op, &ctx, policy, &emitter).await
    })
}

/// Run a read inside an already launched operation.
pub(crate) async fn run_read<O: ReadOperation>(
    op: &O,
    ctx: &OperationContext,
    policy: ReadPolicy,
    emitter: &Emitter<O::Output>,
) -> Result<()> {
    let policy = if ctx.cache.is_corrupt() {
        ReadPolicy::NetworkOnly
    } else {
        policy
    };

    let cached = match policy {
        ReadPolicy::NetworkOnly => None,
        ReadPolicy::LocalOnly => match op.read_local(ctx) {
            Ok(value) => {
                emitter.cached(value);
                return Ok(());
            }
            Err(Error::StorageCorrupt(_)) => None,
            Err(e) => return Err(e),
        },
        ReadPolicy::Both => match op.read_cached(ctx) {
            Ok(hit) => hit,
            Err(Error::StorageCorrupt(_)) => None,
            Err(e) => return Err(e),
        },
    };

    let Some(cached) = cached else {
        let value = refresh(op, ctx, emitter.request()).await?;
        emitter.refreshed(value);
        return Ok(());
    };

    emitter.cached(cached.clone());
    match refresh(op, ctx, emitter.request()).await {
        Ok(value) if value.same_snapshot(&cached) => {
            debug!("Background refresh of {} found no changes", ctx.collection());
        }
        Ok(value) => {
            emitter.refreshed(value);
        }
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => warn!("Background refresh of {} failed: {}", ctx.collection(), e),
    }
    Ok(())
}

/// Fetch and apply, discarding the result if the request was cancelled
/// while the network call ran.
async fn refresh<O: ReadOperation>(
    op: &O,
    ctx: &OperationContext,
    request: &Request,
) -> Result<O::Output> {
    let fetched = op.fetch(ctx, &request.token()).await?;
    request
        .while_live(|| op.apply(ctx, fetched))
        .unwrap_or(Err(Error::Cancelled))
}
