//! Push scheduling: manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use offsync_common::{Error, Result};

use crate::operation::PushOutcome;

/// When pushes run without being asked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only on request.
    #[default]
    Manual,
    /// On request and at regular intervals.
    Periodic {
        /// Time between two scheduled pushes.
        interval: Duration,
    },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Work items for the scheduler task.
#[derive(Debug)]
pub enum SyncRequest {
    /// Replay the pending queue.
    Push,
    /// Stop the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<PushOutcome>>;

/// Front end of a running scheduler.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };
        (scheduler, handle)
    }

    /// Ask for a push and wait for its outcome.
    pub async fn request_push(&self) -> Result<PushOutcome> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((SyncRequest::Push, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))?
    }

    /// Change the sync mode. Takes effect after the current wait.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get the current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Background half of a scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
}

impl SyncSchedulerHandle {
    /// Run until shutdown or until every [`SyncScheduler`] is dropped.
    ///
    /// `push_fn` is called for every requested or scheduled push; pushes
    /// never overlap.
    pub async fn run<F, Fut>(mut self, push_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PushOutcome>> + Send,
    {
        let mut current = self.mode.read().await.interval();
        let mut ticker = current.map(periodic);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some((SyncRequest::Push, response_tx)) => {
                        debug!("Processing requested push");
                        let _ = response_tx.send(push_fn().await);
                    }
                    Some((SyncRequest::Shutdown, _)) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                _ = wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic push");
                    match push_fn().await {
                        Ok(outcome) => info!(
                            "Periodic push completed: {} pushed, {} dropped, {} failed",
                            outcome.pushed,
                            outcome.dropped,
                            outcome.failures.len()
                        ),
                        Err(e) => error!("Periodic push failed: {}", e),
                    }
                }
            }

            let expected = self.mode.read().await.interval();
            if expected != current {
                current = expected;
                ticker = current.map(periodic);
            }
        }
    }
}

fn periodic(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
