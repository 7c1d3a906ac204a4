//! tether-db
//!
//! Uniform database access for the tether engine.
//!
//! Responsibilities:
//! - Safe identifier quoting (dynamic table/column names never reach SQL raw)
//! - A JSON-shaped value/row model shared by both back-ends
//! - `LocalDb`: the embedded SQLite engine, hosted on a dedicated thread
//! - `RemoteDb`: the pooled Postgres client
//! - Database URL parsing (`:memory:`, `file://…`, `postgres://…`)

pub mod ident;
pub mod local;
pub mod location;
pub mod remote;
pub mod value;

pub use ident::{ensure_safe_ident, is_safe_ident, quote_ident};
pub use local::{LocalDb, LocalKind, LocalOptions, Notification};
pub use location::DbLocation;
pub use remote::RemoteDb;
pub use value::{Row, SqlParam};
