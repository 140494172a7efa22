//! Query description and the cache key derived from it.
//!
//! A [`Query`] is forwarded to the backend as-is. Locally it is only
//! evaluated for offline reads and offline removes, so the matcher here
//! understands a small operator set: equality, `$in`, `$ne`, `$gt`, `$gte`,
//! `$lt`, `$lte`, `$exists`, and top-level `$and` / `$or`.

use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

use crate::types::{Record, ID_KEY};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Predicate, sort, limit and skip of a collection read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filter object, keyed by wire field name.
    #[serde(default)]
    pub filter: Map<String, Value>,
    /// Sort keys, most significant first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<(String, SortOrder)>,
    /// Maximum number of results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Number of results to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl Query {
    /// A query matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// A query matching a single id.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::all().eq(ID_KEY, id.into())
    }

    /// A query matching any of the given ids.
    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<Value> = ids.into_iter().map(|id| Value::String(id.into())).collect();
        Self::all().op(ID_KEY, "$in", Value::Array(ids))
    }

    /// Add an equality condition.
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter.insert(field.to_string(), value.into());
        self
    }

    /// Add an operator condition such as `$gt`.
    pub fn op(mut self, field: &str, op: &str, value: impl Into<Value>) -> Self {
        let entry = self
            .filter
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !is_operator_object(entry) {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(ops) = entry {
            ops.insert(op.to_string(), value.into());
        }
        self
    }

    /// Append a sort key.
    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort.push((field.to_string(), order));
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip leading results.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Canonical, order-independent cache key for this query.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut canonical = String::from("filter=");
        write_canonical(&Value::Object(self.filter.clone()), &mut canonical);
        canonical.push_str(";sort=");
        for (field, order) in &self.sort {
            canonical.push_str(field);
            canonical.push(':');
            canonical.push_str(match order {
                SortOrder::Asc => "asc",
                SortOrder::Desc => "desc",
            });
            canonical.push(',');
        }
        canonical.push_str(&format!(
            ";limit={};skip={}",
            self.limit.map(|l| l.to_string()).unwrap_or_default(),
            self.skip.unwrap_or(0)
        ));

        let digest = Blake2s256::digest(canonical.as_bytes());
        Fingerprint(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Evaluate the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        let wire = record.to_wire();
        matches_filter(&self.filter, &wire)
    }

    /// Filter, sort, skip and limit a set of records locally.
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut matched: Vec<(Value, Record)> = records
            .into_iter()
            .map(|r| (r.to_wire(), r))
            .filter(|(wire, _)| matches_filter(&self.filter, wire))
            .collect();

        if !self.sort.is_empty() {
            matched.sort_by(|(a, _), (b, _)| {
                for (field, order) in &self.sort {
                    let ordering = match (lookup(a, field), lookup(b, field)) {
                        (None, None) => Ordering::Equal,
                        (None, Some(_)) => Ordering::Less,
                        (Some(_), None) => Ordering::Greater,
                        (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                    };
                    let ordering = match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        matched
            .into_iter()
            .map(|(_, r)| r)
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Hex digest identifying a query; the key of the query index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Get the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

/// Writes `value` with object keys sorted and `$in` members sorted, so
/// logically equal filters produce identical text.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for key in keys {
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                let member = &map[key];
                if key == "$in" {
                    if let Value::Array(items) = member {
                        let mut parts: Vec<String> = items
                            .iter()
                            .map(|item| {
                                let mut s = String::new();
                                write_canonical(item, &mut s);
                                s
                            })
                            .collect();
                        parts.sort();
                        parts.dedup();
                        out.push('[');
                        out.push_str(&parts.join(","));
                        out.push_str("],");
                        continue;
                    }
                }
                write_canonical(member, out);
                out.push(',');
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_canonical(item, out);
                out.push(',');
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn lookup<'a>(wire: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(wire, |current, part| current.get(part))
        .filter(|v| !v.is_null())
}

fn matches_filter(filter: &Map<String, Value>, wire: &Value) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => sub_filters(condition).all(|f| matches_filter(f, wire)),
        "$or" => sub_filters(condition).any(|f| matches_filter(f, wire)),
        field => matches_condition(lookup(wire, field), condition),
    })
}

fn sub_filters(condition: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    condition
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> bool {
    if !is_operator_object(condition) {
        return actual == Some(condition);
    }

    let Value::Object(ops) = condition else {
        return false;
    };
    ops.iter().all(|(op, expected)| match op.as_str() {
        "$in" => expected
            .as_array()
            .is_some_and(|items| actual.is_some_and(|a| items.contains(a))),
        "$ne" => actual != Some(expected),
        "$exists" => actual.is_some() == expected.as_bool().unwrap_or(true),
        "$gt" => ordered(actual, expected, |o| o == Ordering::Greater),
        "$gte" => ordered(actual, expected, |o| o != Ordering::Less),
        "$lt" => ordered(actual, expected, |o| o == Ordering::Less),
        "$lte" => ordered(actual, expected, |o| o != Ordering::Greater),
        _ => false,
    })
}

fn ordered(actual: Option<&Value>, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|a| compare(a, expected))
        .is_some_and(accept)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
