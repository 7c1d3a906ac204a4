//! Local schema bootstrap: user DDL, sync infrastructure, capture triggers.

use anyhow::{Context, Result};
use tether_db::{quote_ident, LocalDb, SqlParam};
use tracing::{debug, warn};

use crate::meta::{table_columns, TableMeta};

pub const OUTBOX_TABLE: &str = "_outbox";
pub const STATE_TABLE: &str = "_sync_state";
pub const SESSION_TABLE: &str = "_sync_session";

/// Sync infrastructure, idempotent. `_sync_session.applying` is the
/// session-scoped flag the capture triggers consult; the puller raises it
/// inside each apply transaction so remote-origin writes never re-enter the
/// outbox.
const SYNC_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS _sync_state (
  id        INTEGER PRIMARY KEY CHECK (id = 1),
  last_push INTEGER NOT NULL DEFAULT 0,
  last_pull TEXT
);
CREATE TABLE IF NOT EXISTS _outbox (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  table_name TEXT NOT NULL,
  op         TEXT NOT NULL CHECK (op IN ('I','U','D')),
  pk         TEXT NOT NULL,
  row_json   TEXT,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE TABLE IF NOT EXISTS _sync_session (
  id       INTEGER PRIMARY KEY CHECK (id = 1),
  applying INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO _sync_state (id, last_push) VALUES (1, 0);
INSERT OR IGNORE INTO _sync_session (id, applying) VALUES (1, 0);
";

/// Execute user DDL and, when sync is required, install the sync tables and
/// one set of capture triggers per user table.
///
/// User DDL failures are logged and tolerated: statements are commonly
/// idempotent and tables may pre-exist on a reopened file engine.
pub async fn apply_schema(local: &LocalDb, statements: &[String], with_sync: bool) -> Result<()> {
    for stmt in statements {
        let trimmed = stmt.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Err(e) = local.exec_batch(trimmed).await {
            warn!("schema statement failed (continuing): {e:#}");
        }
    }

    if with_sync {
        local
            .exec_batch(SYNC_SCHEMA)
            .await
            .context("install sync tables")?;
        install_all_triggers(local).await?;
    }
    Ok(())
}

/// Install capture triggers on every user table. Returns the tables touched.
pub async fn install_all_triggers(local: &LocalDb) -> Result<Vec<String>> {
    let tables = user_tables(local).await?;
    for table in &tables {
        install_capture_triggers(local, table).await?;
    }
    Ok(tables)
}

/// User tables: everything except SQLite internals and `_`-prefixed names.
pub async fn user_tables(local: &LocalDb) -> Result<Vec<String>> {
    let rows = local
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
            vec![],
        )
        .await
        .context("list user tables")?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect())
}

/// Install the three capture triggers (insert/update/delete) for one table.
/// "Already exists" is not an error.
pub async fn install_capture_triggers(local: &LocalDb, table: &str) -> Result<()> {
    let Some(meta) = table_columns(local, table).await? else {
        anyhow::bail!("cannot install capture triggers: no such table {table}");
    };
    if has_blob_column(local, table).await? {
        // json_object cannot carry blobs; such tables sync inbound only.
        warn!("table {table} has a blob column; skipping change capture");
        return Ok(());
    }
    for sql in capture_trigger_sql(table, &meta)? {
        if let Err(e) = local.exec_batch(&sql).await {
            let msg = format!("{e:#}");
            if msg.contains("already exists") {
                debug!("capture trigger for {table} already exists");
            } else {
                return Err(e).with_context(|| format!("install capture trigger on {table}"));
            }
        }
    }
    Ok(())
}

async fn has_blob_column(local: &LocalDb, table: &str) -> Result<bool> {
    let rows = local
        .query(
            "SELECT type FROM pragma_table_info(?1)",
            vec![SqlParam::from(table)],
        )
        .await?;
    Ok(rows.iter().any(|r| {
        r.get("type")
            .and_then(|v| v.as_str())
            .map(|t| t.to_ascii_uppercase().contains("BLOB"))
            .unwrap_or(false)
    }))
}

/// The trigger bodies. Each fires after a row change, no-ops while a remote
/// apply is in progress, and writes the PK map plus the row image as JSON.
fn capture_trigger_sql(table: &str, meta: &TableMeta) -> Result<[String; 3]> {
    let qtable = quote_ident(table)?;
    let all_cols = meta.all_cols();
    let pk_new = json_object_expr(&meta.pk_cols, "NEW")?;
    let pk_old = json_object_expr(&meta.pk_cols, "OLD")?;
    let row_new = json_object_expr(&all_cols, "NEW")?;

    let guard = "WHEN (SELECT applying FROM _sync_session WHERE id = 1) = 0";
    let stamp = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

    let insert = format!(
        "CREATE TRIGGER IF NOT EXISTS \"_tether_cap_{table}_ins\" AFTER INSERT ON {qtable}\n\
         {guard}\n\
         BEGIN\n\
           INSERT INTO _outbox (table_name, op, pk, row_json, created_at)\n\
           VALUES ('{table}', 'I', {pk_new}, {row_new}, {stamp});\n\
         END;"
    );
    let update = format!(
        "CREATE TRIGGER IF NOT EXISTS \"_tether_cap_{table}_upd\" AFTER UPDATE ON {qtable}\n\
         {guard}\n\
         BEGIN\n\
           INSERT INTO _outbox (table_name, op, pk, row_json, created_at)\n\
           VALUES ('{table}', 'U', {pk_new}, {row_new}, {stamp});\n\
         END;"
    );
    let delete = format!(
        "CREATE TRIGGER IF NOT EXISTS \"_tether_cap_{table}_del\" AFTER DELETE ON {qtable}\n\
         {guard}\n\
         BEGIN\n\
           INSERT INTO _outbox (table_name, op, pk, row_json, created_at)\n\
           VALUES ('{table}', 'D', {pk_old}, NULL, {stamp});\n\
         END;"
    );
    Ok([insert, update, delete])
}

/// `json_object('col', REF."col", …)` over the given columns.
fn json_object_expr(cols: &[String], reference: &str) -> Result<String> {
    let pairs = cols
        .iter()
        .map(|c| {
            let q = quote_ident(c)?;
            Ok(format!("'{c}', {reference}.{q}"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    Ok(format!("json_object({pairs})"))
}

/// Raise or clear the remote-apply session flag outside a transaction (the
/// initial-sync path holds it for the whole seeding phase).
pub async fn set_applying(local: &LocalDb, on: bool) -> Result<()> {
    local
        .exec(
            "UPDATE _sync_session SET applying = ?1 WHERE id = 1",
            vec![SqlParam::Int(i64::from(on))],
        )
        .await
        .context("toggle apply flag")?;
    Ok(())
}

/// Statements that bracket one remote apply in a local transaction.
pub fn applying_guard() -> ((String, Vec<SqlParam>), (String, Vec<SqlParam>)) {
    (
        (
            "UPDATE _sync_session SET applying = 1 WHERE id = 1".to_string(),
            vec![],
        ),
        (
            "UPDATE _sync_session SET applying = 0 WHERE id = 1".to_string(),
            vec![],
        ),
    )
}
