//! Diagnostics payload.

use serde::Serialize;
use tether_db::Row;
use tether_sync::echo::EchoStats;

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub main_database: MainDatabaseInfo,
    pub sync_database: SyncDatabaseInfo,
    /// The `_sync_state` singleton, when sync is configured.
    pub sync_state: Option<Row>,
    pub outbox: OutboxInfo,
    /// Tables with a live metadata-cache entry.
    pub tracked_tables: Vec<String>,
    pub echo_prevention: Option<EchoStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MainDatabaseInfo {
    /// "memory" | "file" | "remote"
    pub r#type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncDatabaseInfo {
    pub has_sync_pool: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OutboxInfo {
    pub total_count: Option<i64>,
    pub error: Option<String>,
}
