//! The engine facade: one embedded (or remote) main database, plus the sync
//! services when a remote of record is configured.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use tether_db::{DbLocation, LocalDb, LocalOptions, RemoteDb, Row, SqlParam};
use tether_sync::echo::EchoCache;
use tether_sync::manager::{SyncConfig, SyncManager};
use tether_sync::meta::MetaCache;
use tether_sync::{bootstrap, mirror, outbox, push, sequences, EdgeNames, SyncShared};

use crate::diagnostic::{Diagnostic, MainDatabaseInfo, OutboxInfo, SyncDatabaseInfo};
use crate::events::EngineEvent;
use crate::options::EngineOptions;

enum MainDb {
    Local(LocalDb),
    Remote(RemoteDb),
}

struct SyncRuntime {
    shared: Arc<SyncShared>,
    manager: SyncManager,
}

pub struct Engine {
    main: MainDb,
    sync: Option<SyncRuntime>,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Bring up the engine: open the main database, apply user DDL, and,
    /// when a sync URL is configured, install the sync infrastructure,
    /// mirror the DDL remotely, run initial sync and start the puller.
    ///
    /// A failure to start the sync services after the databases are open is
    /// not fatal: the engine keeps serving (and pushing) and reports the
    /// failure on the event bus.
    pub async fn init(
        opts: EngineOptions,
        events: broadcast::Sender<EngineEvent>,
        push_signal: Option<mpsc::UnboundedSender<()>>,
    ) -> Result<Engine> {
        match DbLocation::parse(&opts.url)? {
            DbLocation::Remote(url) => {
                if opts.sync_url.is_some() {
                    bail!("sync requires an embedded main database, but the main URL is remote");
                }
                let remote = RemoteDb::connect(&url).await?;
                for stmt in &opts.schema_sql {
                    if let Err(e) = remote.exec(stmt).await {
                        warn!("schema statement failed on remote main (continuing): {e:#}");
                    }
                }
                info!("engine up in direct remote mode (sync unavailable)");
                Ok(Engine {
                    main: MainDb::Remote(remote),
                    sync: None,
                    events,
                })
            }
            location => Self::init_embedded(location, opts, events, push_signal).await,
        }
    }

    async fn init_embedded(
        location: DbLocation,
        opts: EngineOptions,
        events: broadcast::Sender<EngineEvent>,
        push_signal: Option<mpsc::UnboundedSender<()>>,
    ) -> Result<Engine> {
        let mut pragmas = opts.pragmas.clone();
        if pragmas.is_empty() {
            if let DbLocation::File(_) = location {
                pragmas.push("journal_mode=WAL".to_string());
            }
        }
        let local_opts = LocalOptions {
            pragmas,
            extensions: opts.extensions.clone(),
        };
        let local = match &location {
            DbLocation::File(path) => LocalDb::open_file(path, &local_opts)?,
            _ => LocalDb::open_memory(&local_opts)?,
        };

        let Some(sync_url) = opts.sync_url.clone() else {
            bootstrap::apply_schema(&local, &opts.schema_sql, false).await?;
            return Ok(Engine {
                main: MainDb::Local(local),
                sync: None,
                events,
            });
        };

        if !DbLocation::parse(&sync_url)?.is_remote() {
            bail!("sync URL must be a Postgres URL: {sync_url:?}");
        }
        let remote = RemoteDb::connect(&sync_url).await?;

        bootstrap::apply_schema(&local, &opts.schema_sql, true).await?;
        if let Err(e) = mirror::mirror_ddl(&remote, &opts.schema_sql).await {
            warn!("remote DDL mirror failed (continuing): {e:#}");
        }

        let edge_id = opts.edge_id.unwrap_or_else(Uuid::new_v4);
        let shared = Arc::new(SyncShared {
            local: local.clone(),
            remote,
            meta: MetaCache::default(),
            echo: EchoCache::default(),
            names: EdgeNames::new(edge_id),
            lww_column: opts.lww_column.clone(),
            origin_downgraded: AtomicBool::new(false),
            push_batch_limit: None,
            log_metrics: opts.log_metrics,
        });
        let mut manager = SyncManager::new(Arc::clone(&shared), sync_url);

        let config = SyncConfig {
            skip_initial_sync: opts.skip_initial_sync,
            initial_sync_from: opts.initial_sync_from.clone(),
            disable_auto_push: opts.disable_auto_push,
        };
        match manager.start(&config, push_signal).await {
            Ok(()) => {
                let _ = events.send(EngineEvent::PullerStarted);
            }
            Err(e) => {
                warn!("sync services did not start; engine continues without puller: {e:#}");
                let _ = events.send(EngineEvent::Error {
                    source: "sync-start".to_string(),
                    message: format!("{e:#}"),
                });
            }
        }

        Ok(Engine {
            main: MainDb::Local(local),
            sync: Some(SyncRuntime { shared, manager }),
            events,
        })
    }

    /// Parameterized SQL passthrough against the main database.
    pub async fn exec(&self, sql: &str, params: Vec<SqlParam>) -> Result<Vec<Row>> {
        match &self.main {
            MainDb::Local(db) => db.query(sql, params).await,
            MainDb::Remote(db) => {
                if returns_rows(sql) {
                    db.query(sql, &params).await
                } else {
                    db.exec_with(sql, &params).await?;
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Drain the outbox to the remote. Errors propagate to the caller; the
    /// batch retries on the next call.
    pub async fn sync(&self) -> Result<u64> {
        let rt = self
            .sync
            .as_ref()
            .context("sync is not configured for this engine")?;
        let pushed = push::push(&rt.shared).await?;
        if pushed > 0 {
            let _ = self.events.send(EngineEvent::PushCompleted { pushed });
        }
        Ok(pushed)
    }

    /// Align local auto-increment counters with current data.
    pub async fn sync_sequences(&self) -> Result<u64> {
        match &self.main {
            MainDb::Local(db) => sequences::sync_all(db).await,
            MainDb::Remote(_) => bail!("sequence sync requires an embedded main database"),
        }
    }

    pub async fn diagnostic(&self) -> Result<Diagnostic> {
        let main_type = match &self.main {
            MainDb::Local(db) => db.kind().type_name().to_string(),
            MainDb::Remote(_) => "remote".to_string(),
        };

        let (sync_state, outbox_info, tracked_tables, echo_prevention, has_pool) = match &self.sync
        {
            Some(rt) => {
                let state = outbox::sync_state(&rt.shared.local).await.ok().flatten();
                let outbox_info = match outbox::total_count(&rt.shared.local).await {
                    Ok(n) => OutboxInfo {
                        total_count: Some(n),
                        error: None,
                    },
                    Err(e) => OutboxInfo {
                        total_count: None,
                        error: Some(format!("{e:#}")),
                    },
                };
                (
                    state,
                    outbox_info,
                    rt.shared.meta.tracked_tables(),
                    Some(rt.shared.echo.stats()),
                    true,
                )
            }
            None => (
                None,
                OutboxInfo {
                    total_count: None,
                    error: Some("sync not configured".to_string()),
                },
                Vec::new(),
                None,
                false,
            ),
        };

        Ok(Diagnostic {
            main_database: MainDatabaseInfo { r#type: main_type },
            sync_database: SyncDatabaseInfo {
                has_sync_pool: has_pool,
            },
            sync_state,
            outbox: outbox_info,
            tracked_tables,
            echo_prevention,
        })
    }

    /// Remove this edge's remote replication artifacts.
    pub async fn teardown_remote(&self) -> Result<()> {
        let rt = self
            .sync
            .as_ref()
            .context("sync is not configured for this engine")?;
        rt.manager.teardown_remote().await
    }

    /// Shutdown order: puller, remote pool, embedded engine. Errors during
    /// close are logged; the lifecycle completes regardless.
    pub async fn close(&mut self) {
        if let Some(rt) = &mut self.sync {
            rt.manager.shutdown().await;
            rt.shared.remote.close().await;
            let _ = self.events.send(EngineEvent::PullerStopped);
        }
        match &self.main {
            MainDb::Local(db) => {
                if let Err(e) = db.close().await {
                    warn!("error closing embedded engine: {e:#}");
                }
            }
            MainDb::Remote(db) => db.close().await,
        }
    }

    pub fn emit_error(&self, source: &str, error: &anyhow::Error) {
        let _ = self.events.send(EngineEvent::Error {
            source: source.to_string(),
            message: format!("{error:#}"),
        });
    }
}

/// Statements whose reply carries rows (used to route remote passthrough).
fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    matches!(head.as_str(), "select" | "with" | "values" | "show" | "explain" | "table")
}
