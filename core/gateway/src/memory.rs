//! In-process backend for testing.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::gateway::NetworkGateway;
use crate::request::{is_count_segment, Method, SerializedRequest};
use crate::response::GatewayResponse;
use offsync_common::{Error, Record, Result, StatusCategory, ID_KEY};

type Collection = BTreeMap<String, Value>;

#[derive(Default)]
struct Backend {
    collections: HashMap<String, Collection>,
    next_id: u64,
    clock: Option<DateTime<Utc>>,
    rejections: VecDeque<(u16, String)>,
    log: Vec<SerializedRequest>,
}

impl Backend {
    /// Strictly increasing modification time.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + TimeDelta::milliseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn stamp(&mut self, mut body: Map<String, Value>, id: &str, created: Option<Value>) -> Value {
        let now = self.tick().to_rfc3339();
        body.insert(ID_KEY.to_string(), Value::String(id.to_string()));
        let ect = created.unwrap_or_else(|| Value::String(now.clone()));
        body.insert("_kmd".to_string(), json!({ "ect": ect, "lmt": now }));
        Value::Object(body)
    }

    fn handle(&mut self, request: &SerializedRequest, id_prefix: &str) -> Result<Value> {
        let segments = request.segments();
        let name = request.collection.clone();

        match (request.method, segments.as_slice()) {
            (Method::Get, []) => {
                let query = request.query()?;
                let records = self.records(&name)?;
                let projected = request.params.iter().any(|(k, _)| k == "fields");
                let values = query
                    .apply(records)
                    .into_iter()
                    .map(|record| {
                        let wire = record.to_wire();
                        if projected {
                            json!({ ID_KEY: wire[ID_KEY], "_kmd": { "lmt": wire["_kmd"]["lmt"] } })
                        } else {
                            wire
                        }
                    })
                    .collect();
                Ok(Value::Array(values))
            }
            (Method::Get, [segment]) if is_count_segment(segment) => {
                let query = request.query()?;
                let count = self
                    .records(&name)?
                    .iter()
                    .filter(|r| query.matches(r))
                    .count();
                Ok(json!({ "count": count }))
            }
            (Method::Get, [id]) => self
                .collections
                .get(&name)
                .and_then(|c| c.get(*id))
                .cloned()
                .ok_or_else(|| not_found(id)),
            (Method::Post, []) => {
                let body = object_body(request)?;
                self.next_id += 1;
                let id = format!("{}{}", id_prefix, self.next_id);
                let stored = self.stamp(body, &id, None);
                self.collections
                    .entry(name)
                    .or_default()
                    .insert(id, stored.clone());
                Ok(stored)
            }
            (Method::Put, [id]) => {
                let body = object_body(request)?;
                let created = self
                    .collections
                    .get(&name)
                    .and_then(|c| c.get(*id))
                    .and_then(|v| v.get("_kmd"))
                    .and_then(|kmd| kmd.get("ect"))
                    .cloned();
                let stored = self.stamp(body, id, created);
                self.collections
                    .entry(name)
                    .or_default()
                    .insert(id.to_string(), stored.clone());
                Ok(stored)
            }
            (Method::Delete, [id]) => self
                .collections
                .get_mut(&name)
                .and_then(|c| c.remove(*id))
                .map(|_| json!({ "count": 1 }))
                .ok_or_else(|| not_found(id)),
            (Method::Delete, []) => {
                let query = request.query()?;
                let doomed: Vec<String> = self
                    .records(&name)?
                    .into_iter()
                    .filter(|r| query.matches(r))
                    .filter_map(|r| r.id)
                    .collect();
                if let Some(collection) = self.collections.get_mut(&name) {
                    for id in &doomed {
                        collection.remove(id);
                    }
                }
                Ok(json!({ "count": doomed.len() }))
            }
            _ => Err(Error::ServerRejected {
                status: StatusCategory::ClientError(400),
                message: format!("unsupported {:?} {}", request.method, request.path),
            }),
        }
    }

    fn records(&self, name: &str) -> Result<Vec<Record>> {
        self.collections
            .get(name)
            .map(|c| c.values().cloned().map(Record::from_wire).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn object_body(request: &SerializedRequest) -> Result<Map<String, Value>> {
    match &request.body {
        Some(Value::Object(body)) => Ok(body.clone()),
        _ => Err(Error::ServerRejected {
            status: StatusCategory::ClientError(400),
            message: "write without an object body".to_string(),
        }),
    }
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("Entity not found: {}", id))
}

struct Shared {
    backend: Mutex<Backend>,
    offline: AtomicBool,
    calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    id_prefix: String,
}

/// In-process backend.
///
/// Behaves like the REST backend: assigns ids on POST, stamps `_kmd`
/// timestamps on every write, evaluates queries, and answers delta finds
/// with id/lmt projections. Clones share the same backend, so a test can
/// keep a handle while the engine owns another.
#[derive(Clone)]
pub struct MemoryGateway {
    shared: Arc<Shared>,
}

impl MemoryGateway {
    /// Create an empty backend. Assigned ids look like `srv_1`, `srv_2`...
    pub fn new() -> Self {
        Self::with_id_prefix("srv_")
    }

    /// Create an empty backend assigning ids with `prefix`.
    pub fn with_id_prefix(prefix: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(Backend::default()),
                offline: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                latency: Mutex::new(None),
                id_prefix: prefix.into(),
            }),
        }
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every answer, to give cancellation a window.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.shared.latency.lock() = latency;
    }

    /// Answer the next request with an error status instead of handling it.
    pub fn reject_next(&self, status: u16, message: impl Into<String>) {
        self.shared
            .backend
            .lock()
            .rejections
            .push_back((status, message.into()));
    }

    /// Store a record server-side without going through a request.
    ///
    /// The record gets fresh `_kmd` timestamps, as after a PUT.
    pub fn insert(&self, collection: &str, record: Record) -> Result<Record> {
        let id = record
            .id()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidInput("seeded records need an id".to_string()))?;
        let Value::Object(body) = record.to_wire() else {
            return Err(Error::InvalidInput("record is not an object".to_string()));
        };
        let mut backend = self.shared.backend.lock();
        let stored = backend.stamp(body, &id, None);
        backend
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id, stored.clone());
        Record::from_wire(stored)
    }

    /// Remove a record server-side without going through a request.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        self.shared
            .backend
            .lock()
            .collections
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false)
    }

    /// A server-side record.
    pub fn record(&self, collection: &str, id: &str) -> Option<Record> {
        self.shared
            .backend
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id).cloned())
            .and_then(|v| Record::from_wire(v).ok())
    }

    /// Number of server-side records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.shared
            .backend
            .lock()
            .collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Whether a collection is empty server-side.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Requests that reached the backend, in arrival order.
    pub fn requests(&self) -> Vec<SerializedRequest> {
        self.shared.backend.lock().log.clone()
    }

    /// Number of `send` calls, including ones refused while offline.
    pub fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(
        &self,
        request: &SerializedRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.shared.latency.lock();
        if let Some(delay) = latency {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(Error::NetworkUnreachable("memory gateway is offline".to_string()));
        }

        let body = {
            let mut backend = self.shared.backend.lock();
            backend.log.push(request.clone());
            debug!("memory gateway: {:?} {}", request.method, request.path);

            if let Some((status, message)) = backend.rejections.pop_front() {
                return Err(Error::from_status(status, message.clone()).unwrap_or(
                    Error::ServerRejected {
                        status: StatusCategory::ServerError(status),
                        message,
                    },
                ));
            }
            backend.handle(request, &self.shared.id_prefix)?
        };

        GatewayResponse::decode(request.expect, body)
    }
}
