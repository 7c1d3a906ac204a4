//! tether-testkit
//!
//! Scaffolding for scenario tests: sample schemas, throwaway embedded
//! engines, and the env-gated remote database URL.

use anyhow::Result;
use chrono::{SecondsFormat, TimeZone, Utc};
use tether_db::{LocalDb, LocalOptions};
use uuid::Uuid;

/// Scenario tests that need a real Postgres read it from here and skip (with
/// an eprintln) when unset. Point it at a throwaway database: tests create
/// and drop tables, publications and replication slots.
pub const ENV_DB_URL: &str = "TETHER_TEST_DATABASE_URL";

pub fn remote_url() -> Option<String> {
    std::env::var(ENV_DB_URL).ok()
}

/// Route `tracing` output through the test harness when `RUST_LOG` asks for
/// it. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A table name unlikely to collide across concurrent test runs.
pub fn unique_table(prefix: &str) -> String {
    format!("{prefix}_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Portable DDL for the canonical `todos` table (runs on both engines).
pub fn todo_schema() -> Vec<String> {
    vec![
        "CREATE TABLE IF NOT EXISTS todos (\
           id INTEGER PRIMARY KEY, \
           title TEXT NOT NULL, \
           completed BOOLEAN NOT NULL DEFAULT FALSE, \
           updated_at TEXT NOT NULL\
         )"
        .to_string(),
    ]
}

/// Same shape under an arbitrary table name.
pub fn todo_schema_named(table: &str) -> Vec<String> {
    vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
           id INTEGER PRIMARY KEY, \
           title TEXT NOT NULL, \
           completed BOOLEAN NOT NULL DEFAULT FALSE, \
           updated_at TEXT NOT NULL\
         )"
    )]
}

/// An RFC 3339 stamp `secs` seconds past a fixed epoch, handy for writing
/// ordered LWW values.
pub fn stamp(secs: i64) -> String {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .unwrap()
        .checked_add_signed(chrono::Duration::seconds(secs))
        .unwrap()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Throwaway in-memory engine.
pub fn memory_db() -> Result<LocalDb> {
    LocalDb::open_memory(&LocalOptions::default())
}
