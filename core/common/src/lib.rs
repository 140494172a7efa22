//! Common types shared by every offsync crate.
//!
//! This crate provides the foundational vocabulary of the engine: the error
//! type, the record model that flows between cache, queue and network, and
//! the query description used to key cached query results.

pub mod error;
pub mod query;
pub mod types;

pub use error::{Error, Result, StatusCategory};
pub use query::{Fingerprint, Query, SortOrder};
pub use types::{
    is_temp_id, Acl, CollectionName, Metadata, Record, Snapshot, ID_KEY, TEMP_ID_PREFIX,
};
