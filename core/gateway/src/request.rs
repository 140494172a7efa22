//! Serialized requests and the factory that builds them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use offsync_common::{
    is_temp_id, CollectionName, Error, Query, Record, Result, SortOrder, ID_KEY,
};

/// Path segment of the count endpoint.
const COUNT_SEGMENT: &str = "_count";
/// Projection requested by a delta-set find.
const DELTA_FIELDS: &str = "_id,_kmd.lmt";

/// HTTP verb of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read.
    Get,
    /// Create.
    Post,
    /// Replace.
    Put,
    /// Remove.
    Delete,
}

/// Shape of the response body a request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// A single record object.
    Record,
    /// An array of records.
    Records,
    /// An array of `{_id, _kmd.lmt}` projections.
    Tokens,
    /// A `{"count": n}` object.
    Count,
}

/// One backend request as plain data.
///
/// Persisted verbatim in the pending-operation queue, so the format is
/// part of the durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRequest {
    /// Target collection.
    pub collection: String,
    /// HTTP verb.
    pub method: Method,
    /// Path relative to the gateway base, e.g. `books/b1`.
    pub path: String,
    /// Query-string parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
    /// JSON body, for writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Response shape.
    pub expect: Expect,
}

impl SerializedRequest {
    /// Path segments after the collection.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').skip(1).filter(|s| !s.is_empty()).collect()
    }

    /// The query carried in the parameters, if any.
    pub fn query(&self) -> Result<Query> {
        parse_query_params(&self.params)
    }

    /// Point a write at a committed id.
    ///
    /// A create for a temporary id becomes a replace of `new_id`; the body
    /// is re-keyed too.
    pub fn retarget(&self, new_id: &str) -> Self {
        let mut request = self.clone();
        request.path = format!("{}/{}", self.collection, new_id);
        if request.method == Method::Post {
            request.method = Method::Put;
        }
        if let Some(Value::Object(body)) = request.body.as_mut() {
            body.insert(ID_KEY.to_string(), Value::String(new_id.to_string()));
        }
        request
    }
}

/// Builds the requests of one collection.
#[derive(Debug, Clone)]
pub struct RequestFactory {
    collection: CollectionName,
}

impl RequestFactory {
    /// Create a factory for `collection`.
    pub fn new(collection: CollectionName) -> Self {
        Self { collection }
    }

    /// The collection requests are built for.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Find records by query. A delta find asks only for ids and
    /// modification times.
    pub fn find(&self, query: &Query, delta: bool) -> SerializedRequest {
        let mut params = query_params(query);
        if delta {
            params.push(("fields".to_string(), DELTA_FIELDS.to_string()));
        }
        SerializedRequest {
            collection: self.collection.to_string(),
            method: Method::Get,
            path: self.collection.to_string(),
            params,
            body: None,
            expect: if delta { Expect::Tokens } else { Expect::Records },
        }
    }

    /// Fetch one record.
    pub fn get_by_id(&self, id: &str) -> SerializedRequest {
        self.by_id(Method::Get, id, None)
    }

    /// Create or replace a record.
    ///
    /// Records without a committed id are POSTed and the temporary id is
    /// left out of the body; the rest are PUT to their id.
    pub fn save(&self, record: &Record) -> SerializedRequest {
        let mut body = record.to_wire();
        match record.id() {
            Some(id) if !is_temp_id(id) => self.by_id(Method::Put, id, Some(body)),
            _ => {
                if let Value::Object(map) = &mut body {
                    map.remove(ID_KEY);
                }
                SerializedRequest {
                    collection: self.collection.to_string(),
                    method: Method::Post,
                    path: self.collection.to_string(),
                    params: Vec::new(),
                    body: Some(body),
                    expect: Expect::Record,
                }
            }
        }
    }

    /// Remove one record.
    pub fn remove_by_id(&self, id: &str) -> SerializedRequest {
        let mut request = self.by_id(Method::Delete, id, None);
        request.expect = Expect::Count;
        request
    }

    /// Remove every record a query matches.
    pub fn remove_by_query(&self, query: &Query) -> SerializedRequest {
        SerializedRequest {
            collection: self.collection.to_string(),
            method: Method::Delete,
            path: self.collection.to_string(),
            params: query_params(query),
            body: None,
            expect: Expect::Count,
        }
    }

    /// Count the records a query matches.
    pub fn count(&self, query: &Query) -> SerializedRequest {
        SerializedRequest {
            collection: self.collection.to_string(),
            method: Method::Get,
            path: format!("{}/{}", self.collection, COUNT_SEGMENT),
            params: query_params(query),
            body: None,
            expect: Expect::Count,
        }
    }

    fn by_id(&self, method: Method, id: &str, body: Option<Value>) -> SerializedRequest {
        SerializedRequest {
            collection: self.collection.to_string(),
            method,
            path: format!("{}/{}", self.collection, id),
            params: Vec::new(),
            body,
            expect: Expect::Record,
        }
    }
}

/// Whether a path segment addresses the count endpoint.
pub fn is_count_segment(segment: &str) -> bool {
    segment == COUNT_SEGMENT
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if !query.filter.is_empty() {
        params.push((
            "query".to_string(),
            Value::Object(query.filter.clone()).to_string(),
        ));
    }
    if !query.sort.is_empty() {
        let sort: Map<String, Value> = query
            .sort
            .iter()
            .map(|(field, order)| {
                let direction = match order {
                    SortOrder::Asc => 1,
                    SortOrder::Desc => -1,
                };
                (field.clone(), Value::from(direction))
            })
            .collect();
        params.push(("sort".to_string(), Value::Object(sort).to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(skip) = query.skip {
        params.push(("skip".to_string(), skip.to_string()));
    }
    params
}

fn parse_query_params(params: &[(String, String)]) -> Result<Query> {
    let mut query = Query::all();
    for (key, value) in params {
        match key.as_str() {
            "query" => match serde_json::from_str(value)? {
                Value::Object(filter) => query.filter = filter,
                _ => return Err(Error::InvalidInput("query must be an object".to_string())),
            },
            "sort" => {
                let sort: Map<String, Value> = serde_json::from_str(value)?;
                for (field, direction) in sort {
                    let order = if direction.as_i64() == Some(-1) {
                        SortOrder::Desc
                    } else {
                        SortOrder::Asc
                    };
                    query.sort.push((field, order));
                }
            }
            "limit" => query.limit = Some(parse_number(key, value)?),
            "skip" => query.skip = Some(parse_number(key, value)?),
            _ => {}
        }
    }
    Ok(query)
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{} must be a number, got {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory() -> RequestFactory {
        RequestFactory::new(CollectionName::new("books").unwrap())
    }

    #[test]
    fn test_save_new_record_posts_without_temp_id() {
        let mut record = Record::new().field("title", "Dune");
        record.ensure_id();

        let request = factory().save(&record);
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "books");
        let body = request.body.unwrap();
        assert!(body.get(ID_KEY).is_none());
        assert_eq!(body["title"], json!("Dune"));
    }

    #[test]
    fn test_save_committed_record_puts() {
        let request = factory().save(&Record::with_id("b1").field("title", "Dune"));
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.path, "books/b1");
        assert_eq!(request.segments(), vec!["b1"]);
    }

    #[test]
    fn test_retarget_turns_create_into_replace() {
        let request = factory().save(&Record::new().field("title", "Dune"));
        let retargeted = request.retarget("x1");

        assert_eq!(retargeted.method, Method::Put);
        assert_eq!(retargeted.path, "books/x1");
        assert_eq!(retargeted.body.unwrap()[ID_KEY], json!("x1"));
    }

    #[test]
    fn test_query_params_roundtrip() {
        let query = Query::all()
            .eq("author", "Herbert")
            .sort_by("year", SortOrder::Desc)
            .limit(10)
            .skip(5);
        let request = factory().find(&query, false);

        assert_eq!(request.expect, Expect::Records);
        assert_eq!(request.query().unwrap(), query);
    }

    #[test]
    fn test_delta_find_requests_tokens() {
        let request = factory().find(&Query::all(), true);
        assert_eq!(request.expect, Expect::Tokens);
        assert!(request
            .params
            .contains(&("fields".to_string(), DELTA_FIELDS.to_string())));
    }

    #[test]
    fn test_count_path() {
        let request = factory().count(&Query::all());
        assert_eq!(request.path, "books/_count");
        assert!(is_count_segment(request.segments()[0]));
    }

    #[test]
    fn test_request_survives_serialization() {
        let request = factory().save(&Record::with_id("b1").field("n", 1));
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: SerializedRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }
}
