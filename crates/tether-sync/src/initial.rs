//! Initial catch-up: bootstrap local schema from the remote and seed data.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tether_db::{quote_ident, SqlParam};
use tracing::{info, warn};

use crate::{bootstrap, mirror, outbox, sequences, sqlbuild, SyncShared};

const PAGE_SIZE: i64 = 1000;

/// Enumerate remote user tables, mirror each locally, seed rows newer than
/// the optional cutoff under LWW, and align sequences. The capture triggers
/// are disarmed for the whole phase so seeded rows never enter the outbox.
///
/// Table-level failures are logged and skipped; the rest continue.
pub async fn run(shared: &Arc<SyncShared>, from: Option<&str>) -> Result<()> {
    let tables = remote_user_tables(shared).await?;
    info!("initial sync: {} remote table(s)", tables.len());

    bootstrap::set_applying(&shared.local, true).await?;
    let seed_result = seed_tables(shared, &tables, from).await;
    // Re-arm capture even when seeding failed part-way.
    let rearm = bootstrap::set_applying(&shared.local, false).await;
    seed_result?;
    rearm?;

    if let Err(e) = sequences::sync_all(&shared.local).await {
        warn!("sequence alignment after initial sync failed: {e:#}");
    }

    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    outbox::set_last_pull(&shared.local, &stamp).await?;
    Ok(())
}

async fn seed_tables(
    shared: &Arc<SyncShared>,
    tables: &[String],
    from: Option<&str>,
) -> Result<()> {
    for table in tables {
        if let Err(e) = seed_table(shared, table, from).await {
            warn!("initial sync of {table} failed (skipping): {e:#}");
        }
    }
    Ok(())
}

/// Remote user tables: default schema, names not starting with `_`.
async fn remote_user_tables(shared: &SyncShared) -> Result<Vec<String>> {
    let rows = shared
        .remote
        .query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
               AND table_name NOT LIKE '\\_%' ESCAPE '\\' \
             ORDER BY table_name",
            &[],
        )
        .await
        .context("enumerate remote tables")?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get("table_name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

async fn seed_table(shared: &Arc<SyncShared>, table: &str, from: Option<&str>) -> Result<()> {
    mirror::create_table_from_remote(&shared.local, &shared.remote, &shared.meta, table).await?;
    let meta = shared.meta.ensure(&shared.local, table).await?;

    let qtable = quote_ident(table)?;
    let order = meta
        .pk_cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let lww = quote_ident(&shared.lww_column)?;

    let mut offset: i64 = 0;
    let mut seeded: u64 = 0;
    loop {
        let (sql, params): (String, Vec<SqlParam>) = match from {
            // Cast both sides so the cutoff works whether the LWW column is
            // a real timestamp or RFC 3339 text.
            Some(cutoff) if meta.has_column(&shared.lww_column) => (
                format!(
                    "SELECT * FROM {qtable} \
                     WHERE CAST({lww} AS timestamptz) >= CAST($1 AS timestamptz) \
                     ORDER BY {order} LIMIT {PAGE_SIZE} OFFSET {offset}"
                ),
                vec![cutoff.into()],
            ),
            _ => (
                format!("SELECT * FROM {qtable} ORDER BY {order} LIMIT {PAGE_SIZE} OFFSET {offset}"),
                vec![],
            ),
        };
        let rows = shared
            .remote
            .query(&sql, &params)
            .await
            .with_context(|| format!("page remote rows of {table}"))?;
        let page_len = rows.len() as i64;

        for row in rows {
            // Columns the local table does not carry are dropped here.
            let columns = sqlbuild::writable_columns(&meta, &row, table)?;
            let upsert = sqlbuild::local_upsert(table, &meta, &columns, &shared.lww_column)?;
            shared
                .local
                .exec(&upsert, vec![SqlParam::Json(Value::Object(row))])
                .await
                .with_context(|| format!("seed row into {table}"))?;
            seeded += 1;
        }

        if page_len < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    info!("initial sync seeded {seeded} row(s) into {table}");
    Ok(())
}
