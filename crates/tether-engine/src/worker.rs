//! The worker task hosting an engine, and the typed handle that talks to it.
//!
//! One dedicated task owns the `Engine`; hosts exchange request/reply
//! messages with it over a channel. Every request carries a monotonically
//! increasing id (used in logs) and a host-side timeout: on expiry the host
//! abandons the reply while the engine runs the request to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use tether_db::{Row, SqlParam};

use crate::diagnostic::Diagnostic;
use crate::engine::Engine;
use crate::events::{event_bus, EngineEvent};
use crate::options::EngineOptions;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    Exec {
        sql: String,
        params: Vec<SqlParam>,
        reply: Reply<Vec<Row>>,
    },
    Sync {
        reply: Reply<u64>,
    },
    SyncSequences {
        reply: Reply<u64>,
    },
    Diagnostic {
        reply: Reply<Diagnostic>,
    },
    /// Remove the engine's remote replication artifacts (full teardown).
    TeardownRemote {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    /// Debounced outbox notification; failures surface as events only.
    AutoPush,
}

/// Clonable host-side handle to a running engine worker.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<EngineEvent>,
    next_req: Arc<AtomicU64>,
    request_timeout: Duration,
}

/// Start an engine worker. Resolves once the engine is initialized (or
/// failed to); requests sent before that queue behind init.
pub async fn spawn(opts: EngineOptions) -> Result<EngineHandle> {
    let events = event_bus();
    let (tx, rx) = mpsc::unbounded_channel::<Request>();

    // Auto-push notifications re-enter the same request lane, so pushes are
    // serialized with host requests.
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<()>();
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            while push_rx.recv().await.is_some() {
                if tx.send(Request::AutoPush).is_err() {
                    break;
                }
            }
        });
    }

    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
    {
        let events = events.clone();
        tokio::spawn(async move {
            let engine = match Engine::init(opts, events, Some(push_tx)).await {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    engine
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            serve(engine, rx).await;
        });
    }
    ready_rx
        .await
        .map_err(|_| anyhow!("engine worker died during init"))??;

    Ok(EngineHandle {
        tx,
        events,
        next_req: Arc::new(AtomicU64::new(0)),
        request_timeout: DEFAULT_REQUEST_TIMEOUT,
    })
}

async fn serve(mut engine: Engine, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(req) = rx.recv().await {
        match req {
            Request::Exec { sql, params, reply } => {
                let _ = reply.send(engine.exec(&sql, params).await);
            }
            Request::Sync { reply } => {
                let _ = reply.send(engine.sync().await);
            }
            Request::SyncSequences { reply } => {
                let _ = reply.send(engine.sync_sequences().await);
            }
            Request::Diagnostic { reply } => {
                let _ = reply.send(engine.diagnostic().await);
            }
            Request::TeardownRemote { reply } => {
                let _ = reply.send(engine.teardown_remote().await);
            }
            Request::AutoPush => {
                if let Err(e) = engine.sync().await {
                    warn!("auto push failed: {e:#}");
                    engine.emit_error("auto-push", &e);
                }
            }
            Request::Close { reply } => {
                engine.close().await;
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }
    debug!("engine worker stopped");
}

impl EngineHandle {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Parameterized SQL against the main database.
    pub async fn exec(&self, sql: &str, params: Vec<SqlParam>) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        self.request("exec", |reply| Request::Exec { sql, params, reply })
            .await
    }

    /// Push pending outbox rows; returns how many were delivered.
    pub async fn sync(&self) -> Result<u64> {
        self.request("sync", |reply| Request::Sync { reply }).await
    }

    /// Align auto-increment counters; returns how many moved.
    pub async fn sync_sequences(&self) -> Result<u64> {
        self.request("sync-sequences", |reply| Request::SyncSequences { reply })
            .await
    }

    pub async fn diagnostic(&self) -> Result<Diagnostic> {
        self.request("diagnostic", |reply| Request::Diagnostic { reply })
            .await
    }

    /// Drop this edge's replication slot, publication and origin on the
    /// remote. For decommissioning; a restarting engine expects them kept.
    pub async fn teardown_remote(&self) -> Result<()> {
        self.request("teardown-remote", |reply| Request::TeardownRemote { reply })
            .await
    }

    /// Shut the engine down. Further requests fail.
    pub async fn close(&self) -> Result<()> {
        self.request("close", |reply| Request::Close { reply }).await
    }

    /// Background sync events (errors, push completions, puller lifecycle).
    pub fn events(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    async fn request<T, F>(&self, label: &str, make: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Request,
    {
        let req_id = self.next_req.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(req_id, label, "engine request");
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| anyhow!("engine is closed"))?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => bail!(
                "request {req_id} ({label}) timed out after {:?}; the engine keeps running it",
                self.request_timeout
            ),
            Ok(reply) => reply
                .map_err(|_| anyhow!("engine dropped request {req_id} ({label})"))?
                .with_context(|| format!("request {req_id} ({label})")),
        }
    }
}
