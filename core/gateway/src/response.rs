//! Decoded gateway responses.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::request::Expect;
use offsync_common::{Error, Record, Result};

/// Remote `lastModifiedAt` per id, as returned by a delta find.
pub type Tokens = BTreeMap<String, DateTime<Utc>>;

/// A successful backend answer.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    /// One record.
    Record(Record),
    /// A result set.
    Records(Vec<Record>),
    /// Delta tokens.
    Tokens(Tokens),
    /// A count (matches, or removed records).
    Count(u64),
}

impl GatewayResponse {
    /// Decode a response body of the expected shape.
    pub fn decode(expect: Expect, body: Value) -> Result<Self> {
        match expect {
            Expect::Record => Ok(Self::Record(Record::from_wire(body)?)),
            Expect::Records => Ok(Self::Records(
                into_array(body)?
                    .into_iter()
                    .map(Record::from_wire)
                    .collect::<Result<_>>()?,
            )),
            Expect::Tokens => {
                let mut tokens = Tokens::new();
                for item in into_array(body)? {
                    let record = Record::from_wire(item)?;
                    let (Some(id), Some(lmt)) = (record.id, record.metadata.last_modified_at) else {
                        return Err(Error::Serialization(
                            "delta entry without _id or _kmd.lmt".to_string(),
                        ));
                    };
                    tokens.insert(id, lmt);
                }
                Ok(Self::Tokens(tokens))
            }
            Expect::Count => body
                .get("count")
                .and_then(Value::as_u64)
                .map(Self::Count)
                .ok_or_else(|| Error::Serialization("count response without count".to_string())),
        }
    }

    /// Unwrap a single record.
    pub fn into_record(self) -> Result<Record> {
        match self {
            Self::Record(record) => Ok(record),
            other => Err(unexpected("record", &other)),
        }
    }

    /// Unwrap a result set.
    pub fn into_records(self) -> Result<Vec<Record>> {
        match self {
            Self::Records(records) => Ok(records),
            other => Err(unexpected("records", &other)),
        }
    }

    /// Unwrap delta tokens.
    pub fn into_tokens(self) -> Result<Tokens> {
        match self {
            Self::Tokens(tokens) => Ok(tokens),
            other => Err(unexpected("tokens", &other)),
        }
    }

    /// Unwrap a count.
    pub fn into_count(self) -> Result<u64> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(unexpected("count", &other)),
        }
    }
}

fn into_array(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        other => Err(Error::Serialization(format!("expected an array, got {}", other))),
    }
}

fn unexpected(wanted: &str, got: &GatewayResponse) -> Error {
    Error::Serialization(format!("expected {} response, got {:?}", wanted, got))
}
