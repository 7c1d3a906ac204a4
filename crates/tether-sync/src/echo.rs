//! Echo suppression cache.
//!
//! The pusher records `(op, lww)` keyed by table and PK fingerprint immediately
//! after sending a change; the puller consumes the entry on the first
//! matching inbound event and drops that event. Entries are bounded in time:
//! anything older than the eviction budget is discarded so the map cannot
//! grow without bound when an echo never arrives (e.g. origin-filtered
//! server-side, or the remote dropped the write).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tether_db::Row;

use crate::{lww, ChangeOp};

/// Default time budget for unconsumed entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Canonical fingerprint of a row's primary key: the stringified PK values,
/// in key order, joined with `|`. Missing and null values render empty. The
/// pusher and the puller must produce identical fingerprints for the same
/// logical row.
pub fn pk_fingerprint(pk_cols: &[String], row: &Row) -> String {
    pk_cols
        .iter()
        .map(|col| fingerprint_part(row.get(col)))
        .collect::<Vec<_>>()
        .join("|")
}

fn fingerprint_part(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

struct EchoEntry {
    op: ChangeOp,
    lww: Option<Value>,
    recorded_at: Instant,
}

/// Per-table map of in-flight fingerprints.
pub struct EchoCache {
    inner: Mutex<HashMap<String, HashMap<String, EchoEntry>>>,
    ttl: Duration,
}

impl Default for EchoCache {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EchoStats {
    pub tracked_tables: Vec<String>,
    pub entries: usize,
}

impl EchoCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a just-pushed change.
    pub fn record(&self, table: &str, fingerprint: String, op: ChangeOp, lww: Option<Value>) {
        let mut inner = self.inner.lock().expect("echo lock");
        inner.entry(table.to_string()).or_default().insert(
            fingerprint,
            EchoEntry {
                op,
                lww,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Consume an inbound event's entry if it matches: same op, and either a
    /// delete or an inbound LWW value no newer than the stored one. Returns
    /// true when the event should be dropped as an echo.
    pub fn consume_match(
        &self,
        table: &str,
        fingerprint: &str,
        op: ChangeOp,
        inbound_lww: Option<&Value>,
    ) -> bool {
        let mut inner = self.inner.lock().expect("echo lock");
        let Some(entries) = inner.get_mut(table) else {
            return false;
        };
        let Some(entry) = entries.get(fingerprint) else {
            return false;
        };
        if entry.recorded_at.elapsed() > self.ttl {
            entries.remove(fingerprint);
            return false;
        }
        if entry.op != op {
            return false;
        }
        let matched = op == ChangeOp::Delete
            || match (inbound_lww, &entry.lww) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(inbound), Some(stored)) => {
                    lww::compare(inbound, stored) != Ordering::Greater
                }
            };
        if matched {
            entries.remove(fingerprint);
            if entries.is_empty() {
                inner.remove(table);
            }
        }
        matched
    }

    /// Drop entries older than the budget.
    pub fn evict_expired(&self) {
        let mut inner = self.inner.lock().expect("echo lock");
        for entries in inner.values_mut() {
            entries.retain(|_, e| e.recorded_at.elapsed() <= self.ttl);
        }
        inner.retain(|_, entries| !entries.is_empty());
    }

    pub fn stats(&self) -> EchoStats {
        let inner = self.inner.lock().expect("echo lock");
        let mut tracked_tables: Vec<String> = inner.keys().cloned().collect();
        tracked_tables.sort();
        EchoStats {
            tracked_tables,
            entries: inner.values().map(HashMap::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fingerprint_joins_pk_values_in_order() {
        let pk = vec!["org".to_string(), "id".to_string()];
        let r = row(&[("id", json!(7)), ("org", json!("acme")), ("x", json!(1))]);
        assert_eq!(pk_fingerprint(&pk, &r), "acme|7");
    }

    #[test]
    fn fingerprint_renders_null_and_missing_empty() {
        let pk = vec!["a".to_string(), "b".to_string()];
        assert_eq!(pk_fingerprint(&pk, &row(&[("a", json!(null))])), "|");
    }

    #[test]
    fn matching_echo_is_consumed_once() {
        let cache = EchoCache::default();
        cache.record("todos", "1".into(), ChangeOp::Update, Some(json!("2024-06-01T12:00:00Z")));

        assert!(cache.consume_match(
            "todos",
            "1",
            ChangeOp::Update,
            Some(&json!("2024-06-01T12:00:00Z"))
        ));
        // Entry is gone; a second identical event applies normally.
        assert!(!cache.consume_match(
            "todos",
            "1",
            ChangeOp::Update,
            Some(&json!("2024-06-01T12:00:00Z"))
        ));
    }

    #[test]
    fn newer_inbound_value_is_not_an_echo() {
        let cache = EchoCache::default();
        cache.record("todos", "1".into(), ChangeOp::Update, Some(json!("2024-06-01T12:00:00Z")));
        assert!(!cache.consume_match(
            "todos",
            "1",
            ChangeOp::Update,
            Some(&json!("2024-06-01T12:00:01Z"))
        ));
        // The non-match must leave the entry in place for the real echo.
        assert!(cache.consume_match(
            "todos",
            "1",
            ChangeOp::Update,
            Some(&json!("2024-06-01T12:00:00Z"))
        ));
    }

    #[test]
    fn op_mismatch_is_not_an_echo() {
        let cache = EchoCache::default();
        cache.record("todos", "1".into(), ChangeOp::Delete, None);
        assert!(!cache.consume_match("todos", "1", ChangeOp::Update, None));
        assert!(cache.consume_match("todos", "1", ChangeOp::Delete, None));
    }

    #[test]
    fn expired_entries_do_not_match_and_get_swept() {
        let cache = EchoCache::with_ttl(Duration::from_millis(0));
        cache.record("todos", "1".into(), ChangeOp::Insert, None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.consume_match("todos", "1", ChangeOp::Insert, None));

        cache.record("todos", "2".into(), ChangeOp::Insert, None);
        std::thread::sleep(Duration::from_millis(5));
        cache.evict_expired();
        assert_eq!(cache.stats().entries, 0);
    }
}
