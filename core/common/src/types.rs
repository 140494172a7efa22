//! Common types used throughout offsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Prefix of ids assigned to records that have never reached the backend.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Wire key of the record id.
pub const ID_KEY: &str = "_id";
/// Wire key of the access control list.
pub const ACL_KEY: &str = "_acl";
/// Wire key of the system metadata object.
pub const METADATA_KEY: &str = "_kmd";

const CREATED_AT_KEY: &str = "ect";
const LAST_MODIFIED_KEY: &str = "lmt";
const LAST_RECEIVED_KEY: &str = "lrt";

/// Name of a backend collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new collection name.
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains `/`
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.contains('/') {
            return Err(Error::InvalidInput(
                "Collection name cannot contain '/'".to_string(),
            ));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access control list attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// User id of the creator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Readable by everyone.
    #[serde(rename = "gr", default, skip_serializing_if = "Option::is_none")]
    pub global_read: Option<bool>,
    /// Writable by everyone.
    #[serde(rename = "gw", default, skip_serializing_if = "Option::is_none")]
    pub global_write: Option<bool>,
    /// Users allowed to read.
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub readers: Vec<String>,
    /// Users allowed to write.
    #[serde(rename = "w", default, skip_serializing_if = "Vec::is_empty")]
    pub writers: Vec<String>,
}

/// System metadata carried by every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Server-side creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Server-side last modification time; the delta-set token.
    pub last_modified_at: Option<DateTime<Utc>>,
    /// Client-local time the record was last received from the network.
    pub last_received_at: Option<DateTime<Utc>>,
    /// Access control.
    pub acl: Option<Acl>,
}

/// One persisted entity: an opaque field map plus system fields.
///
/// Serializes to and from the backend wire form, where the id lives under
/// `_id`, metadata under `_kmd` and the ACL under `_acl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Record {
    /// Globally unique once committed; absent for an unsaved record.
    pub id: Option<String>,
    /// User fields. Never contains the system keys.
    pub fields: Map<String, Value>,
    /// System metadata.
    pub metadata: Metadata,
}

impl Record {
    /// Create an empty record without an id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record with the given id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Build a record from a JSON object in wire form.
    ///
    /// # Errors
    /// - `value` is not an object
    /// - a system key has the wrong shape
    pub fn from_wire(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::Serialization(
                "Record must be a JSON object".to_string(),
            ));
        };

        let id = match fields.remove(ID_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(other) => {
                return Err(Error::Serialization(format!(
                    "Record id must be a string, got {}",
                    other
                )))
            }
        };

        let acl = match fields.remove(ACL_KEY) {
            None | Some(Value::Null) => None,
            Some(acl) => Some(serde_json::from_value(acl)?),
        };

        let mut metadata = Metadata {
            acl,
            ..Metadata::default()
        };
        if let Some(kmd) = fields.remove(METADATA_KEY) {
            let Value::Object(kmd) = kmd else {
                return Err(Error::Serialization(
                    "Record metadata must be an object".to_string(),
                ));
            };
            metadata.created_at = parse_time(kmd.get(CREATED_AT_KEY))?;
            metadata.last_modified_at = parse_time(kmd.get(LAST_MODIFIED_KEY))?;
            metadata.last_received_at = parse_time(kmd.get(LAST_RECEIVED_KEY))?;
        }

        Ok(Self {
            id,
            fields,
            metadata,
        })
    }

    /// Convert to the wire form.
    pub fn to_wire(&self) -> Value {
        let mut object = self.fields.clone();
        if let Some(id) = &self.id {
            object.insert(ID_KEY.to_string(), Value::String(id.clone()));
        }
        if let Some(acl) = &self.metadata.acl {
            if let Ok(acl) = serde_json::to_value(acl) {
                object.insert(ACL_KEY.to_string(), acl);
            }
        }

        let mut kmd = Map::new();
        let times = [
            (CREATED_AT_KEY, self.metadata.created_at),
            (LAST_MODIFIED_KEY, self.metadata.last_modified_at),
            (LAST_RECEIVED_KEY, self.metadata.last_received_at),
        ];
        for (key, time) in times {
            if let Some(time) = time {
                kmd.insert(key.to_string(), Value::String(time.to_rfc3339()));
            }
        }
        if !kmd.is_empty() {
            object.insert(METADATA_KEY.to_string(), Value::Object(kmd));
        }

        Value::Object(object)
    }

    /// The record id, if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether the record only exists locally (no id, or a temporary id).
    pub fn is_local_only(&self) -> bool {
        self.id.as_deref().map_or(true, is_temp_id)
    }

    /// Assign a fresh temporary id if the record has none, returning the id.
    pub fn ensure_id(&mut self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let id = format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple());
                self.id = Some(id.clone());
                id
            }
        }
    }

    /// Get a user field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a user field. System keys are rejected.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let field = field.into();
        if matches!(field.as_str(), ID_KEY | ACL_KEY | METADATA_KEY) {
            return Err(Error::InvalidInput(format!(
                "'{}' is a system field",
                field
            )));
        }
        self.fields.insert(field, value.into());
        Ok(())
    }

    /// Builder-style field setter for literals.
    pub fn field(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Stamp the client-local receive time.
    pub fn mark_received(&mut self, at: DateTime<Utc>) {
        self.metadata.last_received_at = Some(at);
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.to_wire()
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Record::from_wire(value)
    }
}

/// Whether an id was assigned locally and never confirmed by the backend.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn parse_time(value: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::Serialization(format!("Invalid timestamp '{}': {}", s, e))),
        Some(other) => Err(Error::Serialization(format!(
            "Timestamp must be a string, got {}",
            other
        ))),
    }
}

/// Value comparison used to decide whether a background refresh changed
/// anything the caller can observe.
pub trait Snapshot {
    /// True when both sides carry the same observable content.
    fn same_snapshot(&self, other: &Self) -> bool;
}

impl Snapshot for Record {
    // lrt changes on every receipt, so it is not part of the content.
    fn same_snapshot(&self, other: &Self) -> bool {
        self.id == other.id
            && self.fields == other.fields
            && self.metadata.created_at == other.metadata.created_at
            && self.metadata.last_modified_at == other.metadata.last_modified_at
            && self.metadata.acl == other.metadata.acl
    }
}

impl<T: Snapshot> Snapshot for Vec<T> {
    fn same_snapshot(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other).all(|(a, b)| a.same_snapshot(b))
    }
}

impl<T: Snapshot> Snapshot for Option<T> {
    fn same_snapshot(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_snapshot(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Snapshot for u64 {
    fn same_snapshot(&self, other: &Self) -> bool {
        self == other
    }
}
