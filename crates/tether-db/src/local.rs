//! The embedded SQLite back-end.
//!
//! A `LocalDb` is a cheap clonable handle to a dedicated OS thread that owns
//! the `rusqlite::Connection`. All embedded work is serialized by that
//! thread; async callers exchange commands and oneshot replies with it.
//!
//! Change notification: rusqlite's `update_hook` reports row inserts into
//! watched tables (the sync layer watches `_outbox`), replacing the
//! LISTEN/NOTIFY channel a server engine would offer.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::hooks::Action;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::value::{Row, SqlParam};

/// What actually backs the embedded engine after open (a failed file open
/// falls back to memory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalKind {
    Memory,
    File(PathBuf),
}

impl LocalKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LocalKind::Memory => "memory",
            LocalKind::File(_) => "file",
        }
    }
}

/// An insert notification from a watched table. `payload` is the new rowid.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Open-time knobs for the embedded engine.
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    /// `PRAGMA` statements applied at open, e.g. `journal_mode=WAL`.
    pub pragmas: Vec<String>,
    /// SQLite extension libraries loaded at open.
    pub extensions: Vec<String>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Cmd {
    Query {
        sql: String,
        params: Vec<SqlParam>,
        reply: Reply<Vec<Row>>,
    },
    Exec {
        sql: String,
        params: Vec<SqlParam>,
        reply: Reply<u64>,
    },
    ExecBatch {
        sql: String,
        reply: Reply<()>,
    },
    /// Run every statement inside one transaction; roll back on the first
    /// failure.
    ExecTx {
        stmts: Vec<(String, Vec<SqlParam>)>,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

type Watchers = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<Notification>)>>>;

/// Handle to the embedded engine thread.
#[derive(Clone)]
pub struct LocalDb {
    tx: mpsc::UnboundedSender<Cmd>,
    watchers: Watchers,
    kind: LocalKind,
}

impl LocalDb {
    /// Open an in-memory engine.
    pub fn open_memory(opts: &LocalOptions) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory engine")?;
        Self::start(conn, LocalKind::Memory, opts)
    }

    /// Open a file-backed engine, creating parent directories on demand.
    /// Falls back to in-memory with a warning when the path is unusable.
    pub fn open_file(path: &PathBuf, opts: &LocalOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data directory {parent:?}"))?;
            }
        }
        match Connection::open(path) {
            Ok(conn) => Self::start(conn, LocalKind::File(path.clone()), opts),
            Err(e) => {
                warn!("cannot open embedded database at {path:?} ({e}); falling back to memory");
                Self::open_memory(opts)
            }
        }
    }

    fn start(conn: Connection, kind: LocalKind, opts: &LocalOptions) -> Result<Self> {
        for pragma in &opts.pragmas {
            conn.execute_batch(&format!("PRAGMA {pragma};"))
                .with_context(|| format!("apply pragma {pragma:?}"))?;
        }

        if !opts.extensions.is_empty() {
            // rusqlite marks extension loading unsafe; the caller vouches for
            // the libraries it configures.
            unsafe {
                conn.load_extension_enable()
                    .context("enable extension loading")?;
                for ext in &opts.extensions {
                    if let Err(e) = conn.load_extension(ext, None) {
                        warn!("failed to load extension {ext:?}: {e}");
                    }
                }
            }
            conn.load_extension_disable()
                .context("disable extension loading")?;
        }

        let watchers: Watchers = Arc::new(Mutex::new(Vec::new()));
        {
            let watchers = Arc::clone(&watchers);
            conn.update_hook(Some(
                move |action: Action, _db: &str, table: &str, rowid: i64| {
                    if !matches!(action, Action::SQLITE_INSERT) {
                        return;
                    }
                    let mut ws = watchers.lock().expect("watcher lock poisoned");
                    ws.retain(|(watched, tx)| {
                        if watched != table {
                            return true;
                        }
                        tx.send(Notification {
                            channel: watched.clone(),
                            payload: rowid.to_string(),
                        })
                        .is_ok()
                    });
                },
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let kind_for_thread = kind.clone();
        std::thread::Builder::new()
            .name("tether-localdb".to_string())
            .spawn(move || run(conn, rx, kind_for_thread))
            .context("spawn embedded engine thread")?;

        Ok(Self { tx, watchers, kind })
    }

    pub fn kind(&self) -> &LocalKind {
        &self.kind
    }

    /// Subscribe to row inserts into `table`. The notification payload is
    /// the new rowid.
    pub fn listen(&self, table: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .expect("watcher lock poisoned")
            .push((table.to_string(), tx));
        rx
    }

    pub async fn query(&self, sql: &str, params: Vec<SqlParam>) -> Result<Vec<Row>> {
        self.call(|reply| Cmd::Query {
            sql: sql.to_string(),
            params,
            reply,
        })
        .await
    }

    pub async fn exec(&self, sql: &str, params: Vec<SqlParam>) -> Result<u64> {
        self.call(|reply| Cmd::Exec {
            sql: sql.to_string(),
            params,
            reply,
        })
        .await
    }

    /// Execute a multi-statement SQL script.
    pub async fn exec_batch(&self, sql: &str) -> Result<()> {
        self.call(|reply| Cmd::ExecBatch {
            sql: sql.to_string(),
            reply,
        })
        .await
    }

    /// Execute all statements in one transaction.
    pub async fn exec_tx(&self, stmts: Vec<(String, Vec<SqlParam>)>) -> Result<()> {
        self.call(|reply| Cmd::ExecTx { stmts, reply }).await
    }

    pub async fn close(&self) -> Result<()> {
        self.call(|reply| Cmd::Close { reply }).await
    }

    async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Cmd,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| anyhow!("embedded engine is closed"))?;
        rx.await.map_err(|_| anyhow!("embedded engine dropped request"))?
    }
}

fn run(mut conn: Connection, mut rx: mpsc::UnboundedReceiver<Cmd>, kind: LocalKind) {
    debug!("embedded engine thread up ({})", kind.type_name());
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Cmd::Query { sql, params, reply } => {
                let _ = reply.send(do_query(&conn, &sql, &params));
            }
            Cmd::Exec { sql, params, reply } => {
                let _ = reply.send(do_exec(&conn, &sql, &params));
            }
            Cmd::ExecBatch { sql, reply } => {
                let _ = reply.send(conn.execute_batch(&sql).map_err(Into::into));
            }
            Cmd::ExecTx { stmts, reply } => {
                let _ = reply.send(do_exec_tx(&mut conn, stmts));
            }
            Cmd::Close { reply } => {
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }
    debug!("embedded engine thread down");
}

fn do_query(conn: &Connection, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("prepare failed: {sql}"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .with_context(|| format!("query failed: {sql}"))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().with_context(|| format!("step failed: {sql}"))? {
        let mut obj = Map::new();
        for (i, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), value_ref_to_json(row.get_ref(i)?));
        }
        out.push(obj);
    }
    Ok(out)
}

fn do_exec(conn: &Connection, sql: &str, params: &[SqlParam]) -> Result<u64> {
    let n = conn
        .execute(sql, rusqlite::params_from_iter(params.iter()))
        .with_context(|| format!("exec failed: {sql}"))?;
    Ok(n as u64)
}

fn do_exec_tx(conn: &mut Connection, stmts: Vec<(String, Vec<SqlParam>)>) -> Result<()> {
    let tx = conn.transaction().context("begin transaction")?;
    for (sql, params) in &stmts {
        tx.execute(sql, rusqlite::params_from_iter(params.iter()))
            .with_context(|| format!("exec failed in transaction: {sql}"))?;
    }
    tx.commit().context("commit transaction")?;
    Ok(())
}

fn value_ref_to_json(v: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        // JSON cannot carry raw bytes; blob columns are not part of the sync
        // contract.
        ValueRef::Blob(_) => Value::Null,
    }
}
