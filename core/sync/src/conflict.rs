//! Conflict handling for replayed writes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use offsync_common::Error;

use crate::queue::PendingOperation;

/// How a replay conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The backend's copy is the newer write: drop the pending operation
    /// and adopt the server state.
    #[default]
    LastWriterWins,
    /// Leave the operation queued and report the failure.
    KeepPending,
}

/// What to do with an operation whose replay failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Remove it from the queue; the server state stands.
    Drop,
    /// Keep it for the next push.
    Keep,
}

/// Decides the fate of failed replays.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a resolver with the given strategy.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolve the failure of `op`.
    ///
    /// Only conflicts are ever dropped; every other failure keeps the
    /// operation queued.
    pub fn resolve(&self, op: &PendingOperation, err: &Error) -> Resolution {
        if !err.is_conflict() {
            return Resolution::Keep;
        }
        match self.strategy {
            ConflictStrategy::LastWriterWins => {
                debug!(
                    "Dropping operation {} on {:?}: server copy is newer",
                    op.sequence, op.object_id
                );
                Resolution::Drop
            }
            ConflictStrategy::KeepPending => {
                warn!(
                    "Conflict replaying operation {} on {:?}; keeping it queued",
                    op.sequence, op.object_id
                );
                Resolution::Keep
            }
        }
    }
}
