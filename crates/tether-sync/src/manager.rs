//! Sync lifecycle: initial catch-up, puller, auto-push, shutdown order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pull::Puller;
use crate::{initial, SyncShared};

/// Debounce window between an outbox notification and the push it triggers,
/// so a burst of writes becomes one batch.
const AUTO_PUSH_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub skip_initial_sync: bool,
    /// Optional LWW cutoff for the initial seed (timestamp text).
    pub initial_sync_from: Option<String>,
    pub disable_auto_push: bool,
}

/// Supervises the sync services around one engine.
pub struct SyncManager {
    shared: Arc<SyncShared>,
    puller: Puller,
    auto_push_task: Option<JoinHandle<()>>,
}

impl SyncManager {
    pub fn new(shared: Arc<SyncShared>, sync_url: String) -> Self {
        let puller = Puller::new(Arc::clone(&shared), sync_url);
        Self {
            shared,
            puller,
            auto_push_task: None,
        }
    }

    /// Run initial sync (unless skipped), start the puller, and wire the
    /// auto-push notification handler. `push_signal` receives one `()` per
    /// debounced outbox burst; the engine worker serializes the actual push.
    pub async fn start(
        &mut self,
        config: &SyncConfig,
        push_signal: Option<mpsc::UnboundedSender<()>>,
    ) -> Result<()> {
        if !config.skip_initial_sync {
            initial::run(&self.shared, config.initial_sync_from.as_deref())
                .await
                .context("initial sync")?;
        }

        self.puller.start().await.context("start puller")?;

        if !config.disable_auto_push {
            if let Some(signal) = push_signal {
                self.spawn_auto_push(signal);
            }
        }
        info!("sync services running (edge {})", self.shared.names.edge_id());
        Ok(())
    }

    fn spawn_auto_push(&mut self, signal: mpsc::UnboundedSender<()>) {
        let mut outbox_rx = self.shared.local.listen("_outbox");
        let task = tokio::spawn(async move {
            while outbox_rx.recv().await.is_some() {
                tokio::time::sleep(AUTO_PUSH_DEBOUNCE).await;
                while outbox_rx.try_recv().is_ok() {}
                if signal.send(()).is_err() {
                    break;
                }
            }
            debug!("auto-push listener stopped");
        });
        self.auto_push_task = Some(task);
    }

    pub fn puller_running(&self) -> bool {
        self.puller.is_running()
    }

    /// Stop order: puller first (drops its replication connection cleanly),
    /// then the auto-push listener. The engine closes the pools afterwards.
    pub async fn shutdown(&mut self) {
        self.puller.stop().await;
        if let Some(task) = self.auto_push_task.take() {
            task.abort();
        }
    }

    /// Remove this edge's remote artifacts: slot, publication, origin.
    pub async fn teardown_remote(&self) -> Result<()> {
        let names = &self.shared.names;
        self.shared
            .remote
            .query(
                "SELECT pg_drop_replication_slot(slot_name) AS dropped \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[names.slot().as_str().into()],
            )
            .await
            .context("drop replication slot")?;
        self.shared
            .remote
            .exec(&format!(
                "DROP PUBLICATION IF EXISTS \"{}\"",
                names.publication()
            ))
            .await
            .context("drop publication")?;
        self.shared
            .remote
            .query(
                "SELECT pg_replication_origin_drop(roname) AS dropped \
                 FROM pg_replication_origin WHERE roname = $1",
                &[names.origin().as_str().into()],
            )
            .await
            .context("drop replication origin")?;
        Ok(())
    }
}
