//! Offline-first sync engine
//!
//! Per-collection data stores that answer reads from a local cache, the
//! backend, or both, and write through to the backend or queue writes for
//! a later push:
//! - Read policies: network only, local only, cached-then-refreshed
//! - Write policies: network only, local only, local then network
//! - Durable FIFO queue of pending writes, replayed by push
//! - Conflict handling when the backend rejects a replayed write
//! - Cancellable requests with streamed results

pub mod completion;
pub mod config;
pub mod conflict;
pub mod datastore;
pub mod engine;
mod operation;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use completion::{Emitter, Event, Response};
pub use config::{DataStoreConfig, EngineConfig, ReadPolicy, WritePolicy};
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution};
pub use datastore::DataStore;
pub use engine::SyncEngine;
pub use operation::{PushFailure, PushOutcome, RemoveTarget};
pub use queue::{ChangeType, PendingOperation, PendingQueue};
pub use request::{MultiRequest, Request};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::RequestState;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = DataStoreConfig::default();
        let _engine_config = EngineConfig::default();
        let _resolver = ConflictResolver::default();
        let request = Request::new();
        assert_eq!(request.state(), RequestState::Idle);
    }
}
