//! The durable outbox and sync-state rows.

use anyhow::{Context, Result};
use serde_json::Value;
use tether_db::{LocalDb, Row, SqlParam};

use crate::ChangeOp;

/// One captured local mutation, in replay order.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub table_name: String,
    pub op: ChangeOp,
    /// PK values keyed by column name.
    pub pk: Row,
    /// Full post-image for I/U, absent for D.
    pub row_json: Option<Row>,
}

/// Largest outbox id already delivered to the remote.
pub async fn last_push(local: &LocalDb) -> Result<i64> {
    let rows = local
        .query("SELECT last_push FROM _sync_state WHERE id = 1", vec![])
        .await
        .context("read _sync_state")?;
    Ok(rows
        .first()
        .and_then(|r| r.get("last_push"))
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

/// Outbox rows with `id > after`, strictly ascending.
pub async fn pending(local: &LocalDb, after: i64, limit: Option<i64>) -> Result<Vec<OutboxRow>> {
    let sql = match limit {
        Some(n) => format!(
            "SELECT id, table_name, op, pk, row_json FROM _outbox \
             WHERE id > ?1 ORDER BY id LIMIT {n}"
        ),
        None => "SELECT id, table_name, op, pk, row_json FROM _outbox \
                 WHERE id > ?1 ORDER BY id"
            .to_string(),
    };
    let rows = local
        .query(&sql, vec![SqlParam::Int(after)])
        .await
        .context("read _outbox")?;

    rows.iter().map(parse_row).collect()
}

fn parse_row(row: &Row) -> Result<OutboxRow> {
    let id = row
        .get("id")
        .and_then(Value::as_i64)
        .context("outbox row without id")?;
    let table_name = row
        .get("table_name")
        .and_then(Value::as_str)
        .context("outbox row without table_name")?
        .to_string();
    let op = ChangeOp::parse(
        row.get("op")
            .and_then(Value::as_str)
            .context("outbox row without op")?,
    )?;
    let pk = parse_json_object(row.get("pk"))
        .with_context(|| format!("outbox row {id}: bad pk"))?
        .with_context(|| format!("outbox row {id}: missing pk"))?;
    let row_json = parse_json_object(row.get("row_json"))
        .with_context(|| format!("outbox row {id}: bad row_json"))?;
    Ok(OutboxRow {
        id,
        table_name,
        op,
        pk,
        row_json,
    })
}

fn parse_json_object(v: Option<&Value>) -> Result<Option<Row>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let parsed: Value = serde_json::from_str(s).context("parse JSON column")?;
            Ok(parsed.as_object().cloned())
        }
        Some(Value::Object(m)) => Ok(Some(m.clone())),
        Some(other) => anyhow::bail!("expected JSON object, got {other}"),
    }
}

/// Advance `last_push` and delete acknowledged rows, atomically. `last_push`
/// never moves backwards.
pub async fn mark_pushed(local: &LocalDb, up_to: i64) -> Result<()> {
    local
        .exec_tx(vec![
            (
                "UPDATE _sync_state SET last_push = ?1 WHERE id = 1 AND last_push < ?1".to_string(),
                vec![SqlParam::Int(up_to)],
            ),
            (
                "DELETE FROM _outbox WHERE id <= ?1".to_string(),
                vec![SqlParam::Int(up_to)],
            ),
        ])
        .await
        .context("acknowledge pushed outbox rows")
}

pub async fn total_count(local: &LocalDb) -> Result<i64> {
    let rows = local
        .query("SELECT COUNT(*) AS n FROM _outbox", vec![])
        .await?;
    Ok(rows
        .first()
        .and_then(|r| r.get("n"))
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

/// The `_sync_state` singleton, for diagnostics.
pub async fn sync_state(local: &LocalDb) -> Result<Option<Row>> {
    let rows = local
        .query(
            "SELECT last_push, last_pull FROM _sync_state WHERE id = 1",
            vec![],
        )
        .await?;
    Ok(rows.into_iter().next())
}

/// Stamp the high-water mark of the last successful catch-up.
pub async fn set_last_pull(local: &LocalDb, stamp: &str) -> Result<()> {
    local
        .exec(
            "UPDATE _sync_state SET last_pull = ?1 WHERE id = 1",
            vec![SqlParam::from(stamp)],
        )
        .await
        .context("stamp last_pull")?;
    Ok(())
}
