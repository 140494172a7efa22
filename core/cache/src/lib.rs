//! Local record cache for offsync.
//!
//! Each collection gets one [`Cache`]: full record snapshots keyed by id,
//! a query index mapping query fingerprints to ordered id lists, and the
//! delta-token map used for incremental refresh. Caches are handed out by
//! a [`CacheManager`], which also publishes storage faults.

pub mod cache;
pub mod entry;
pub mod manager;

pub use cache::{Cache, CacheKey, DeltaUpdate};
pub use entry::{DeltaBaseline, QueryEntry};
pub use manager::{CacheFault, CacheManager};
