//! Sequence alignment.
//!
//! Tables mirrored with an auto-increment key track their counters in
//! `sqlite_sequence`. After seeding rows with explicit ids, the counter must
//! sit at `max(key)` so the next local insert allocates past the seeded
//! range. Alignment is monotone: the counter never moves backwards.

use anyhow::{Context, Result};
use serde_json::Value;
use tether_db::{quote_ident, LocalDb, SqlParam};
use tracing::debug;

use crate::meta::table_columns;

/// Align the counter for one table. Returns true when the counter advanced.
pub async fn sync_table(local: &LocalDb, table: &str) -> Result<bool> {
    let Some(meta) = table_columns(local, table).await? else {
        return Ok(false);
    };
    // Only a single-column key can alias the rowid counter.
    let [pk] = meta.pk_cols.as_slice() else {
        return Ok(false);
    };

    let qtable = quote_ident(table)?;
    let qpk = quote_ident(pk)?;
    let rows = local
        .query(
            &format!("SELECT COALESCE(MAX({qpk}), 0) AS m FROM {qtable}"),
            vec![],
        )
        .await
        .with_context(|| format!("read max key of {table}"))?;
    let max = rows
        .first()
        .and_then(|r| r.get("m"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if max <= 0 {
        return Ok(false);
    }

    let advanced = local
        .exec(
            "UPDATE sqlite_sequence SET seq = ?2 WHERE name = ?1 AND seq < ?2",
            vec![SqlParam::from(table), SqlParam::Int(max)],
        )
        .await?;
    let inserted = local
        .exec(
            "INSERT INTO sqlite_sequence (name, seq) \
             SELECT ?1, ?2 WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = ?1)",
            vec![SqlParam::from(table), SqlParam::Int(max)],
        )
        .await?;

    if advanced + inserted > 0 {
        debug!("sequence for {table} set to {max}");
    }
    Ok(advanced + inserted > 0)
}

/// Align every auto-increment user table. Returns how many counters moved.
pub async fn sync_all(local: &LocalDb) -> Result<u64> {
    if !has_sequence_table(local).await? {
        return Ok(0);
    }
    let tables = autoincrement_tables(local).await?;
    let mut synced = 0;
    for table in &tables {
        if sync_table(local, table).await? {
            synced += 1;
        }
    }
    Ok(synced)
}

async fn has_sequence_table(local: &LocalDb) -> Result<bool> {
    let rows = local
        .query(
            "SELECT 1 AS one FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
            vec![],
        )
        .await?;
    Ok(!rows.is_empty())
}

/// User tables declared with AUTOINCREMENT.
async fn autoincrement_tables(local: &LocalDb) -> Result<Vec<String>> {
    let rows = local
        .query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
            vec![],
        )
        .await
        .context("list tables for sequence sync")?;
    Ok(rows
        .iter()
        .filter(|r| {
            r.get("sql")
                .and_then(Value::as_str)
                .map(|s| s.to_ascii_uppercase().contains("AUTOINCREMENT"))
                .unwrap_or(false)
        })
        .filter_map(|r| r.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}
