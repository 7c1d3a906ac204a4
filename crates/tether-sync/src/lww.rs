//! Ordering for Last-Write-Wins values.
//!
//! The designated LWW column usually holds a timestamp, but the engine never
//! gets to dictate its type. Comparison is best-effort: timestamps (in any of
//! the shapes Postgres and RFC 3339 produce) order by instant, numbers order
//! numerically, and everything else falls back to string order, mirroring
//! what the SQL-side guard does with the column's natural collation.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Parse a timestamp in RFC 3339 or Postgres text shapes to unix micros.
pub fn timestamp_micros(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_micros());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.timestamp_micros());
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp_micros());
        }
    }
    None
}

/// Canonical RFC 3339 UTC rendering, `None` when `s` is not a timestamp.
pub fn normalize_timestamp(s: &str) -> Option<String> {
    let micros = timestamp_micros(s)?;
    let dt: DateTime<Utc> = DateTime::from_timestamp_micros(micros)?;
    Some(dt.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Best-effort ordering of two LWW values.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        let x = x.as_f64().unwrap_or(f64::NAN);
        let y = y.as_f64().unwrap_or(f64::NAN);
        return x.total_cmp(&y);
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        if let (Some(x), Some(y)) = (timestamp_micros(x), timestamp_micros(y)) {
            return x.cmp(&y);
        }
        return x.cmp(y);
    }
    render(a).cmp(&render(b))
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
