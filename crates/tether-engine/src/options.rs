//! Engine configuration. Environment-free: everything arrives here.

use uuid::Uuid;

pub const DEFAULT_LWW_COLUMN: &str = "updated_at";

/// Options for bringing up one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Main database: `""`/`:memory:`, `file://<path>`, or `postgres://…`.
    pub url: String,
    /// Remote database of record; enables sync. Must be a Postgres URL.
    pub sync_url: Option<String>,
    /// User DDL, one statement per entry, applied at init (and mirrored to
    /// the remote when sync is on).
    pub schema_sql: Vec<String>,
    /// Stable identity; names the replication artifacts. Random when unset.
    pub edge_id: Option<Uuid>,
    /// The designated LWW conflict column.
    pub lww_column: String,
    pub skip_initial_sync: bool,
    /// Timestamp cutoff for the initial seed.
    pub initial_sync_from: Option<String>,
    pub disable_auto_push: bool,
    /// SQLite extension libraries, embedded engines only.
    pub extensions: Vec<String>,
    /// SQLite pragmas applied at open, embedded engines only.
    pub pragmas: Vec<String>,
    /// Log per-push metrics at info level.
    pub log_metrics: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            url: ":memory:".to_string(),
            sync_url: None,
            schema_sql: Vec::new(),
            edge_id: None,
            lww_column: DEFAULT_LWW_COLUMN.to_string(),
            skip_initial_sync: false,
            initial_sync_from: None,
            disable_auto_push: false,
            extensions: Vec::new(),
            pragmas: Vec::new(),
            log_metrics: false,
        }
    }
}

impl EngineOptions {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}
