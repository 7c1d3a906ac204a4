//! tether-sync
//!
//! The synchronization core: outbox-based change capture on the embedded
//! side, a logical-decoding puller from the remote side, a batched pusher
//! replaying local changes under Last-Write-Wins, echo suppression, initial
//! catch-up, and sequence alignment.
//!
//! Data flow: a local write fires the capture trigger, which appends an
//! `_outbox` row and a notification; the pusher drains the outbox into a
//! remote upsert/delete batch and records an echo-cache entry; when the
//! remote's replication stream echoes the same change back, the puller
//! filters it out via origin and echo cache, and applies everything else
//! under LWW.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Result};
use tether_db::{LocalDb, RemoteDb};
use uuid::Uuid;

pub mod bootstrap;
pub mod echo;
pub mod initial;
pub mod lww;
pub mod manager;
pub mod meta;
pub mod mirror;
pub mod outbox;
pub mod pgoutput;
pub mod pull;
pub mod push;
pub mod sequences;
pub mod sqlbuild;

pub use echo::{pk_fingerprint, EchoCache};
pub use manager::{SyncConfig, SyncManager};
pub use meta::{MetaCache, TableMeta};

/// The three captured mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Insert => "I",
            ChangeOp::Update => "U",
            ChangeOp::Delete => "D",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "I" => ChangeOp::Insert,
            "U" => ChangeOp::Update,
            "D" => ChangeOp::Delete,
            other => bail!("unknown change op: {other:?}"),
        })
    }
}

/// Names of the per-edge replication artifacts on the remote.
#[derive(Debug, Clone)]
pub struct EdgeNames {
    edge_id: Uuid,
}

impl EdgeNames {
    pub fn new(edge_id: Uuid) -> Self {
        Self { edge_id }
    }

    pub fn edge_id(&self) -> Uuid {
        self.edge_id
    }

    /// Publication name, edge id without dashes.
    pub fn publication(&self) -> String {
        format!("edge_pub_{}", self.edge_id.simple())
    }

    /// Replication slot name, edge id without dashes.
    pub fn slot(&self) -> String {
        format!("edge_{}", self.edge_id.simple())
    }

    /// Replication origin name (full UUID form).
    pub fn origin(&self) -> String {
        self.edge_id.to_string()
    }
}

/// State shared between the pusher, the puller and the manager.
///
/// The pusher and puller run on different tasks; the caches guard their maps
/// with mutexes held only for the duration of a single operation.
pub struct SyncShared {
    pub local: LocalDb,
    pub remote: RemoteDb,
    pub meta: MetaCache,
    pub echo: EchoCache,
    pub names: EdgeNames,
    pub lww_column: String,
    /// Set once when the remote refuses replication-origin APIs; suppression
    /// then relies on the echo cache alone.
    pub origin_downgraded: AtomicBool,
    /// Optional cap on outbox rows per push batch. `None` drains everything.
    pub push_batch_limit: Option<i64>,
    pub log_metrics: bool,
}

impl SyncShared {
    pub fn new(local: LocalDb, remote: RemoteDb, edge_id: Uuid, lww_column: String) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            meta: MetaCache::default(),
            echo: EchoCache::default(),
            names: EdgeNames::new(edge_id),
            lww_column,
            origin_downgraded: AtomicBool::new(false),
            push_batch_limit: None,
            log_metrics: false,
        })
    }
}
