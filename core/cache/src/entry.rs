//! Persisted index entries.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cached query result: ordered ids plus freshness information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    /// Result ids in result order.
    pub ids: Vec<String>,
    /// When the result arrived from the network.
    pub received_at: DateTime<Utc>,
    /// Freshness window in seconds; zero means never fresh.
    pub ttl_secs: u64,
}

impl QueryEntry {
    /// Whether the entry has outlived its freshness window at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        is_stale(Some(self.received_at), self.ttl_secs, now)
    }
}

/// The state a delta fetch diffs against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaBaseline {
    /// Ids the query returned last time.
    pub ids: Vec<String>,
    /// Last known `lastModifiedAt` per id.
    pub tokens: BTreeMap<String, DateTime<Utc>>,
}

impl DeltaBaseline {
    /// Ids whose token is new or differs from the baseline.
    pub fn changed<'a>(
        &'a self,
        remote: &'a BTreeMap<String, DateTime<Utc>>,
    ) -> impl Iterator<Item = &'a String> + 'a {
        remote
            .iter()
            .filter(|(id, lmt)| self.tokens.get(*id) != Some(*lmt))
            .map(|(id, _)| id)
    }

    /// Baseline ids the remote no longer reports.
    pub fn removed<'a>(
        &'a self,
        remote: &'a BTreeMap<String, DateTime<Utc>>,
    ) -> impl Iterator<Item = &'a String> + 'a {
        self.ids.iter().filter(|id| !remote.contains_key(*id))
    }
}

/// `ttl == 0` or a missing receive time is always stale. A window too
/// large to represent never expires.
pub(crate) fn is_stale(received_at: Option<DateTime<Utc>>, ttl_secs: u64, now: DateTime<Utc>) -> bool {
    match received_at {
        _ if ttl_secs == 0 => true,
        None => true,
        Some(at) => {
            let window = i64::try_from(ttl_secs).ok().and_then(TimeDelta::try_seconds);
            match window {
                Some(window) => now - at > window,
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_staleness_window() {
        let now = at(1_000);
        assert!(is_stale(Some(now), 0, now));
        assert!(is_stale(None, 60, now));
        assert!(!is_stale(Some(at(950)), 60, now));
        assert!(!is_stale(Some(at(940)), 60, now));
        assert!(is_stale(Some(at(939)), 60, now));
    }

    #[test]
    fn test_huge_window_never_expires() {
        let now = at(1_000);
        assert!(!is_stale(Some(at(0)), u64::MAX, now));
        assert!(!is_stale(Some(at(0)), i64::MAX as u64, now));
        assert!(is_stale(None, u64::MAX, now));
    }

    #[test]
    fn test_baseline_diff() {
        let baseline = DeltaBaseline {
            ids: vec!["a".into(), "b".into(), "c".into()],
            tokens: BTreeMap::from([
                ("a".to_string(), at(1)),
                ("b".to_string(), at(2)),
                ("c".to_string(), at(3)),
            ]),
        };
        let remote = BTreeMap::from([
            ("a".to_string(), at(1)),
            ("b".to_string(), at(20)),
            ("d".to_string(), at(4)),
        ]);

        let changed: Vec<_> = baseline.changed(&remote).cloned().collect();
        let removed: Vec<_> = baseline.removed(&remote).cloned().collect();
        assert_eq!(changed, vec!["b", "d"]);
        assert_eq!(removed, vec!["c"]);
    }
}
