//! Durable key-value storage for offsync.
//!
//! The cache and the pending-operation queue persist through the narrow
//! [`DurableStore`] interface: namespaced get/put/delete/scan over opaque
//! bytes. The byte layout is chosen by the layers above; backends only
//! guarantee that a put is visible to every later read.
//!
//! # Design Principles
//! - Backend isolation: no cache or queue logic in the backends
//! - Synchronous calls: async callers hop to the blocking pool themselves
//! - Unified error semantics: transient failures are `Error::Storage` or
//!   `Error::Io`, and only those are retried

pub mod memory;
pub mod registry;
pub mod retry;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use retry::{retry_once, RetryExecutor};
pub use sqlite::SqliteStore;
pub use store::{BatchOp, DurableStore};
