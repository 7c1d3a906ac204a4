//! Engine event bus.
//!
//! Background push and apply failures never reach a caller's `Result`; they
//! surface here instead so hosts can observe sync health.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Error { source: String, message: String },
    PushCompleted { pushed: u64 },
    PullerStarted,
    PullerStopped,
}

const EVENT_BUS_CAPACITY: usize = 64;

pub fn event_bus() -> broadcast::Sender<EngineEvent> {
    broadcast::channel(EVENT_BUS_CAPACITY).0
}
