//! The pusher: drain `_outbox` in id order into one remote transaction.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, warn};

use crate::echo::pk_fingerprint;
use crate::outbox::{self, OutboxRow};
use crate::sqlbuild;
use crate::{ChangeOp, SyncShared};

/// Replay all pending outbox rows to the remote. Returns the number of rows
/// delivered; 0 without touching the remote transaction when nothing is
/// pending.
///
/// On failure the remote transaction rolls back and `last_push` stays put, so
/// the whole batch is retried on the next push.
pub async fn push(shared: &Arc<SyncShared>) -> Result<u64> {
    let last = outbox::last_push(&shared.local).await?;
    let rows = outbox::pending(&shared.local, last, shared.push_batch_limit).await?;
    if rows.is_empty() {
        return Ok(0);
    }
    let started = Instant::now();

    ensure_origin(shared).await;

    let mut tx = shared
        .remote
        .pool()
        .begin()
        .await
        .context("begin push transaction")?;
    setup_origin_session(&mut tx, shared).await;

    if let Err(e) = replay(&mut tx, shared, &rows).await {
        tx.rollback().await.ok();
        return Err(e);
    }
    tx.commit().await.context("commit push transaction")?;

    let max_id = rows.last().map(|r| r.id).unwrap_or(last);
    outbox::mark_pushed(&shared.local, max_id).await?;

    // Entries the stream never echoes back must not linger.
    let sweeper = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(sweeper.echo.ttl()).await;
        sweeper.echo.evict_expired();
    });

    if shared.log_metrics {
        info!(
            pushed = rows.len(),
            first_id = rows.first().map(|r| r.id).unwrap_or_default(),
            last_id = max_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "outbox batch pushed"
        );
    }
    Ok(rows.len() as u64)
}

async fn replay(
    tx: &mut Transaction<'_, Postgres>,
    shared: &SyncShared,
    rows: &[OutboxRow],
) -> Result<()> {
    for row in rows {
        let meta = shared.meta.ensure(&shared.local, &row.table_name).await?;

        let fingerprint = pk_fingerprint(&meta.pk_cols, &row.pk);
        let lww = row
            .row_json
            .as_ref()
            .and_then(|image| image.get(&shared.lww_column))
            .cloned();
        shared
            .echo
            .record(&row.table_name, fingerprint, row.op, lww);

        match row.op {
            ChangeOp::Delete => {
                let sql = sqlbuild::remote_delete(&row.table_name, &meta.pk_cols)?;
                tether_db::remote::bind_param(
                    sqlx::query(&sql),
                    &tether_db::SqlParam::Json(Value::Object(row.pk.clone())),
                )
                .execute(&mut **tx)
                .await
                .with_context(|| format!("outbox row {}: remote delete", row.id))?;
            }
            ChangeOp::Insert | ChangeOp::Update => {
                let image = row
                    .row_json
                    .as_ref()
                    .with_context(|| format!("outbox row {}: missing row image", row.id))?;
                let columns = sqlbuild::writable_columns(&meta, image, &row.table_name)?;
                let sql =
                    sqlbuild::remote_upsert(&row.table_name, &meta, &columns, &shared.lww_column)?;
                tether_db::remote::bind_param(
                    sqlx::query(&sql),
                    &tether_db::SqlParam::Json(Value::Object(image.clone())),
                )
                .execute(&mut **tx)
                .await
                .with_context(|| format!("outbox row {}: remote upsert", row.id))?;
            }
        }
    }
    Ok(())
}

/// Make sure our replication origin exists (no-op once downgraded). Runs
/// outside the push transaction so a refusal cannot poison it.
async fn ensure_origin(shared: &SyncShared) {
    if shared.origin_downgraded.load(AtomicOrdering::Relaxed) {
        return;
    }
    let sql = "SELECT pg_replication_origin_create($1) \
               WHERE NOT EXISTS (SELECT 1 FROM pg_replication_origin WHERE roname = $1)";
    match sqlx::query(sql)
        .bind(shared.names.origin())
        .execute(shared.remote.pool())
        .await
    {
        Ok(_) => {}
        Err(e) if is_permission_denied(&e) => downgrade(shared),
        Err(e) => warn!("replication origin create failed: {e}"),
    }
}

/// Label this transaction's WAL with our origin so other subscribers can
/// filter it at the stream boundary. Guarded by a savepoint: any refusal
/// leaves the push transaction healthy.
async fn setup_origin_session(tx: &mut Transaction<'_, Postgres>, shared: &SyncShared) {
    if shared.origin_downgraded.load(AtomicOrdering::Relaxed) {
        return;
    }
    if let Err(e) = sqlx::query("SAVEPOINT origin_setup").execute(&mut **tx).await {
        warn!("origin savepoint failed: {e}");
        return;
    }
    match sqlx::query("SELECT pg_replication_origin_session_setup($1)")
        .bind(shared.names.origin())
        .execute(&mut **tx)
        .await
    {
        Ok(_) => {
            let _ = sqlx::query("RELEASE SAVEPOINT origin_setup")
                .execute(&mut **tx)
                .await;
        }
        Err(e) => {
            if let Err(rb) = sqlx::query("ROLLBACK TO SAVEPOINT origin_setup")
                .execute(&mut **tx)
                .await
            {
                warn!("origin savepoint rollback failed: {rb}");
            }
            if is_permission_denied(&e) {
                downgrade(shared);
            } else if error_code(&e).as_deref() == Some("55000") {
                // Session already carries our origin from an earlier batch on
                // this pooled connection.
                debug!("replication origin already active on this session");
            } else {
                warn!("replication origin session setup failed: {e}");
            }
        }
    }
}

fn downgrade(shared: &SyncShared) {
    if !shared.origin_downgraded.swap(true, AtomicOrdering::Relaxed) {
        warn!(
            "remote refuses replication origin APIs; \
             echo suppression falls back to the echo cache"
        );
    }
}

fn error_code(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c.to_string())
}

fn is_permission_denied(e: &sqlx::Error) -> bool {
    error_code(e).as_deref() == Some("42501")
}
