//! Typed event bus over a closed set of supervisor events.
//!
//! Components publish into one broadcast channel; subscribers react to the
//! variants they care about. Events are best-effort: emitting with no live
//! subscribers is not an error.

use crate::config::ConfigSource;
use crate::message::WorkerResponse;
use crate::resource::MemoryAlert;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Everything the subsystem announces about itself.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    WorkerStarted,
    WorkerStopped,
    WorkerExited { reason: String },
    WorkerError { message: String },
    UnsolicitedMessage(WorkerResponse),
    HealthCheckMissed { consecutive: u32 },
    WorkerUnhealthy { consecutive: u32 },
    WorkerHealthy,
    MemoryAlert(MemoryAlert),
    RestartRequested { reason: RestartReason },
    RetryRequested { record_id: Uuid, attempt: u32, delay: Duration },
    EscalationRaised { record_id: Uuid, message: String },
    RecoveryExhausted { record_id: Uuid },
    CircuitBreakerActivated { service: String },
    ConfigSectionChanged { section: &'static str, source: ConfigSource },
    ConfigApplied { version: u64, source: ConfigSource },
    ConfigReset,
}

/// Why a worker restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    WorkerFault,
    MemoryLimit,
    Manual,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SupervisorEvent) {
        if let Err(err) = self.tx.send(event) {
            trace!("Event dropped, no subscribers: {:?}", err.0);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
