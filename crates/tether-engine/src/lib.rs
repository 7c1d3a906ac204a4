//! tether-engine
//!
//! A local-first database client: an embedded SQLite engine bound to a
//! remote Postgres database of record, kept in continuous bidirectional
//! agreement by the sync services in `tether-sync`. Also supports a purely
//! remote mode for ordinary server-side use.
//!
//! Hosts talk to a running engine through [`EngineHandle`], a typed
//! request/response channel to the dedicated worker task that owns the
//! engine:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use tether_engine::{spawn, EngineOptions};
//!
//! let mut opts = EngineOptions::with_url("file:///var/lib/app/data.db");
//! opts.sync_url = Some("postgres://app@db.internal/app".to_string());
//! opts.schema_sql = vec![
//!     "CREATE TABLE IF NOT EXISTS todos (
//!        id INTEGER PRIMARY KEY,
//!        title TEXT NOT NULL,
//!        completed BOOLEAN NOT NULL DEFAULT FALSE,
//!        updated_at TEXT NOT NULL)"
//!         .to_string(),
//! ];
//!
//! let engine = spawn(opts).await?;
//! engine
//!     .exec(
//!         "INSERT INTO todos (id, title, updated_at) VALUES ($1, $2, $3)",
//!         vec![1i64.into(), "ship it".into(), "2024-06-01T12:00:00Z".into()],
//!     )
//!     .await?;
//! let pushed = engine.sync().await?;
//! assert_eq!(pushed, 1);
//! # Ok(()) }
//! ```

pub mod diagnostic;
pub mod engine;
pub mod events;
pub mod options;
pub mod worker;

pub use diagnostic::Diagnostic;
pub use engine::Engine;
pub use events::EngineEvent;
pub use options::EngineOptions;
pub use worker::{spawn, EngineHandle};

pub use tether_db::{Row, SqlParam};
