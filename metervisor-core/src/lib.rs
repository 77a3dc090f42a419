//! Metervisor Core Library
//!
//! Supervision of an isolated meter-polling worker task: a correlated duplex
//! message channel, heartbeat health checks, memory governance, error
//! classification with typed recovery, restart backoff with a circuit breaker,
//! and validated hot-reloadable configuration.

pub mod config;
pub mod error_handler;
pub mod event;
pub mod health;
pub mod message;
pub mod observability;
pub mod ops;
pub mod resource;
pub mod restart;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use config::{
    load_update_from_sources, watch_config_file, ConfigChange, ConfigError, ConfigManager,
    ConfigSource, ConfigUpdate, SupervisorConfig, UpdateOutcome,
};
pub use error_handler::{
    ErrorContext, ErrorHandler, ErrorKind, ErrorRecord, ErrorSource, ErrorStats, RecoveryStrategy,
    Severity,
};
pub use event::{EventBus, RestartReason, SupervisorEvent};
pub use health::{HealthMonitor, HealthReport, HealthState};
pub use message::{
    DeviceDescriptor, HeartbeatReport, MemoryReading, MeterReading, RegisterMap, RequestBody,
    ResponseBody, WorkerRequest, WorkerResponse, WorkerStatusReport,
};
pub use observability::init_observability;
pub use ops::{install_panic_hook, shutdown_signal, wait_for_shutdown};
pub use resource::{
    MemoryAlert, MemoryAlertKind, MemoryPeak, MemorySample, MemoryStats, MemoryTrend,
    ResourceMonitor,
};
pub use restart::{CircuitBreaker, CircuitState, RestartBackoff, RestartManager};
pub use runtime::{LogSink, MeterSupervisorRuntime, ReadingSink, Statistics, StatusReport};
pub use supervisor::{Supervisor, WorkerStatus};
pub use worker::{MeterReader, SimulatedMeterReader};

/// Error type for supervisor-side operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker is not running")]
    WorkerNotRunning,

    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    #[error("{kind} request timed out after {timeout:?}")]
    RequestTimeout {
        kind: &'static str,
        timeout: std::time::Duration,
    },

    #[error("worker stopped while the request was pending")]
    Stopped,

    #[error("worker channel closed")]
    ChannelClosed,

    #[error("worker reported an error: {0}")]
    Worker(String),
}

impl SupervisorError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SupervisorError::RequestTimeout { .. }
                | SupervisorError::ChannelClosed
                | SupervisorError::Worker(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
