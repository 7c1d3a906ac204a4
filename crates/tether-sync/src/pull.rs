//! The puller: consume the remote's logical-replication stream and apply it
//! locally under LWW.
//!
//! The subscription is the SQL logical-decoding interface: a dedicated
//! connection peeks pgoutput frames from our slot on a short interval,
//! applies them in order, then advances the slot to the last committed
//! transaction. Peek-then-advance keeps delivery at-least-once; the LWW
//! guard and idempotent deletes absorb the duplicates a crash can produce.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{Connection, PgConnection, Row as _};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::echo::pk_fingerprint;
use crate::pgoutput::{self, Message, Relation};
use crate::{bootstrap, mirror, sqlbuild, ChangeOp, SyncShared};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Puller {
    shared: Arc<SyncShared>,
    sync_url: String,
    poll_interval: Duration,
    task: Option<JoinHandle<()>>,
    stop: Option<watch::Sender<bool>>,
}

impl Puller {
    pub fn new(shared: Arc<SyncShared>, sync_url: String) -> Self {
        Self {
            shared,
            sync_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            task: None,
            stop: None,
        }
    }

    /// Ensure publication and slot, then start the streaming task. Returns
    /// once the stream is running; stream errors after that are logged and
    /// retried in the background.
    pub async fn start(&mut self) -> Result<()> {
        setup_replication(&self.shared).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let sync_url = self.sync_url.clone();
        let poll = self.poll_interval;
        let task = tokio::spawn(run_stream(shared, sync_url, poll, stop_rx));

        self.stop = Some(stop_tx);
        self.task = Some(task);
        info!("puller streaming from slot {}", self.shared.names.slot());
        Ok(())
    }

    /// Stop the streaming task and drop its connection.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

/// Create the publication and replication slot for this edge. When slot
/// creation fails (typically a slot budget exhausted by crashed instances),
/// inactive slots of the `edge_*` family are garbage-collected once and the
/// creation retried. The sweep never runs while creation succeeds: slots
/// driven through the SQL decoding interface show `active = false` between
/// polls, so an unconditional sweep would reap live peers.
async fn setup_replication(shared: &SyncShared) -> Result<()> {
    let publication = shared.names.publication();
    let slot = shared.names.slot();

    let create_pub = format!("CREATE PUBLICATION \"{publication}\" FOR ALL TABLES");
    if let Err(e) = shared.remote.exec(&create_pub).await {
        if pg_error_code(&e).as_deref() == Some("42710") {
            debug!("publication {publication} already exists");
        } else {
            return Err(e).context("create publication");
        }
    }

    if !slot_exists(shared, &slot).await? {
        let create = "SELECT 1 FROM pg_create_logical_replication_slot($1, 'pgoutput')";
        if let Err(first) = shared
            .remote
            .query(create, &[slot.as_str().into()])
            .await
        {
            if pg_error_code(&first).as_deref() == Some("42710") {
                debug!("slot {slot} already exists");
            } else {
                // Possibly out of slots; sweep once more and retry.
                warn!("slot creation failed ({first:#}); retrying after slot sweep");
                drop_inactive_edge_slots(shared, &slot).await;
                shared
                    .remote
                    .query(create, &[slot.as_str().into()])
                    .await
                    .context("create replication slot")?;
            }
        }
    }
    Ok(())
}

async fn slot_exists(shared: &SyncShared, slot: &str) -> Result<bool> {
    let rows = shared
        .remote
        .query(
            "SELECT 1 AS one FROM pg_replication_slots WHERE slot_name = $1",
            &[slot.into()],
        )
        .await
        .context("probe replication slot")?;
    Ok(!rows.is_empty())
}

async fn drop_inactive_edge_slots(shared: &SyncShared, own_slot: &str) {
    let stale = shared
        .remote
        .query(
            "SELECT slot_name FROM pg_replication_slots \
             WHERE plugin = 'pgoutput' AND NOT active \
               AND slot_name LIKE 'edge\\_%' ESCAPE '\\' AND slot_name <> $1",
            &[own_slot.into()],
        )
        .await;
    let Ok(stale) = stale else {
        return;
    };
    for row in stale {
        let Some(name) = row.get("slot_name").and_then(Value::as_str) else {
            continue;
        };
        match shared
            .remote
            .query(
                "SELECT pg_drop_replication_slot($1) AS dropped",
                &[name.into()],
            )
            .await
        {
            Ok(_) => info!("dropped inactive replication slot {name}"),
            Err(e) => debug!("could not drop slot {name}: {e}"),
        }
    }
}

async fn run_stream(
    shared: Arc<SyncShared>,
    sync_url: String,
    poll: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut conn: Option<PgConnection> = None;
    let mut relations: HashMap<u32, Relation> = HashMap::new();

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        if conn.is_none() {
            match PgConnection::connect(&sync_url).await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    warn!("replication connection failed: {e}");
                    continue;
                }
            }
        }
        let Some(c) = conn.as_mut() else { continue };

        if let Err(e) = poll_once(&shared, c, &mut relations).await {
            warn!("replication poll failed: {e:#}");
            // Reconnect on the next tick; a broken connection poisons
            // everything else.
            conn = None;
        }
    }

    if let Some(c) = conn {
        let _ = c.close().await;
    }
    debug!("puller stream stopped");
}

async fn poll_once(
    shared: &Arc<SyncShared>,
    conn: &mut PgConnection,
    relations: &mut HashMap<u32, Relation>,
) -> Result<()> {
    let rows = sqlx::query(
        "SELECT data FROM pg_logical_slot_peek_binary_changes($1, NULL, NULL, \
         'proto_version', '1', 'publication_names', $2)",
    )
    .bind(shared.names.slot())
    .bind(shared.names.publication())
    .fetch_all(&mut *conn)
    .await
    .context("peek replication slot")?;
    if rows.is_empty() {
        return Ok(());
    }

    let own_origin = shared.names.origin();
    let mut current_origin: Option<String> = None;
    let mut last_commit: Option<u64> = None;

    for row in &rows {
        let data: Vec<u8> = row.try_get("data").context("read replication frame")?;
        match pgoutput::decode_message(&data)? {
            Message::Begin { .. } => current_origin = None,
            Message::Origin { name } => current_origin = Some(name),
            Message::Relation(rel) => {
                relations.insert(rel.id, rel);
            }
            Message::Commit { end_lsn, .. } => {
                last_commit = Some(end_lsn);
                current_origin = None;
            }
            Message::Insert { rel_id, new } => {
                handle_event(
                    shared,
                    relations,
                    rel_id,
                    ChangeOp::Insert,
                    None,
                    new,
                    current_origin.as_deref(),
                    &own_origin,
                )
                .await;
            }
            Message::Update { rel_id, old, new } => {
                handle_event(
                    shared,
                    relations,
                    rel_id,
                    ChangeOp::Update,
                    old,
                    new,
                    current_origin.as_deref(),
                    &own_origin,
                )
                .await;
            }
            Message::Delete { rel_id, key } => {
                handle_event(
                    shared,
                    relations,
                    rel_id,
                    ChangeOp::Delete,
                    None,
                    key,
                    current_origin.as_deref(),
                    &own_origin,
                )
                .await;
            }
            Message::Truncate { .. } | Message::Other(_) => {}
        }
    }

    if let Some(lsn) = last_commit {
        let lsn_text = format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF);
        sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
            .bind(shared.names.slot())
            .bind(&lsn_text)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("advance slot to {lsn_text}"))?;
    }
    Ok(())
}

/// Route one stream event. Apply failures are logged and skipped: the remote
/// stays the source of truth and any future write re-propagates the row.
#[allow(clippy::too_many_arguments)]
async fn handle_event(
    shared: &Arc<SyncShared>,
    relations: &HashMap<u32, Relation>,
    rel_id: u32,
    op: ChangeOp,
    old: Option<pgoutput::TupleData>,
    tuple: pgoutput::TupleData,
    current_origin: Option<&str>,
    own_origin: &str,
) {
    // Server-assisted echo suppression: our own transactions carry our
    // origin label whenever the pusher managed to set it.
    if current_origin == Some(own_origin) {
        return;
    }
    let Some(rel) = relations.get(&rel_id) else {
        warn!("stream event for unknown relation {rel_id}; skipping");
        return;
    };
    if rel.namespace != "public" || rel.name.starts_with('_') {
        return;
    }

    let result = async {
        let row = pgoutput::decode_row(rel, &tuple)?;
        let old_key = match &old {
            Some(old_tuple) => Some(pgoutput::decode_row(rel, old_tuple)?),
            None => None,
        };
        apply_event(shared, &rel.name, op, old_key, row).await
    }
    .await;

    if let Err(e) = result {
        warn!("apply of {} {:?} failed (skipping): {e:#}", rel.name, op);
    }
}

async fn apply_event(
    shared: &Arc<SyncShared>,
    table: &str,
    op: ChangeOp,
    old_key: Option<tether_db::Row>,
    row: tether_db::Row,
) -> Result<()> {
    if shared
        .meta
        .lookup_existing(&shared.local, table)
        .await?
        .is_none()
    {
        mirror::create_table_from_remote(&shared.local, &shared.remote, &shared.meta, table)
            .await?;
    }
    let meta = shared.meta.ensure(&shared.local, table).await?;

    let fingerprint = pk_fingerprint(&meta.pk_cols, &row);
    if shared
        .echo
        .consume_match(table, &fingerprint, op, row.get(&shared.lww_column))
    {
        debug!("suppressed echo for {table} [{fingerprint}]");
        return Ok(());
    }

    match apply_local_change(
        &shared.local,
        &meta,
        table,
        op,
        old_key.as_ref(),
        &row,
        &shared.lww_column,
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(e) if format!("{e:#}").contains("no such table") => {
            // Repair and retry once.
            mirror::create_table_from_remote(&shared.local, &shared.remote, &shared.meta, table)
                .await?;
            let meta = shared.meta.ensure(&shared.local, table).await?;
            apply_local_change(
                &shared.local,
                &meta,
                table,
                op,
                old_key.as_ref(),
                &row,
                &shared.lww_column,
            )
            .await
        }
        Err(e) => Err(e),
    }
}

/// Apply one inbound change in one local transaction: raise the session
/// flag (disarming the capture triggers), apply, clear the flag.
#[allow(clippy::too_many_arguments)]
pub async fn apply_local_change(
    local: &tether_db::LocalDb,
    meta: &crate::meta::TableMeta,
    table: &str,
    op: ChangeOp,
    old_key: Option<&tether_db::Row>,
    row: &tether_db::Row,
    lww_column: &str,
) -> Result<()> {
    let (set_flag, clear_flag) = bootstrap::applying_guard();
    let mut stmts = vec![set_flag];

    // A primary-key update arrives with the old key: remove the old row,
    // then upsert the new image.
    if let Some(old) = old_key {
        stmts.push((
            sqlbuild::local_delete(table, &meta.pk_cols)?,
            vec![tether_db::SqlParam::Json(Value::Object((*old).clone()))],
        ));
    }
    match op {
        ChangeOp::Delete => {
            stmts.push((
                sqlbuild::local_delete(table, &meta.pk_cols)?,
                vec![tether_db::SqlParam::Json(Value::Object(row.clone()))],
            ));
        }
        ChangeOp::Insert | ChangeOp::Update => {
            let columns = sqlbuild::writable_columns(meta, row, table)?;
            stmts.push((
                sqlbuild::local_upsert(table, meta, &columns, lww_column)?,
                vec![tether_db::SqlParam::Json(Value::Object(row.clone()))],
            ));
        }
    }
    stmts.push(clear_flag);
    local.exec_tx(stmts).await
}

/// The SQLSTATE of a wrapped sqlx error, if any.
fn pg_error_code(e: &anyhow::Error) -> Option<String> {
    e.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|d| d.code())
        .map(|c| c.to_string())
}
