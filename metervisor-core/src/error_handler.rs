//! Error classification, history, and typed recovery dispatch.
//!
//! Every reported fault is classified into a kind, assigned a severity, logged,
//! recorded in a bounded history, and routed to a recovery strategy. Recovery
//! attempts per record are capped by the kind's budget; exhaustion is announced
//! once and further attempts become no-ops.

use crate::config::ConfigManager;
use crate::event::{EventBus, RestartReason, SupervisorEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMM_RETRY_DELAYS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];
const TIMEOUT_RETRY_DELAYS: &[Duration] = &[
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];
const UNKNOWN_RETRY_DELAYS: &[Duration] = &[Duration::from_secs(1), Duration::from_secs(5)];
const DEFAULT_RETRY_DELAYS: &[Duration] = &[Duration::from_secs(1)];

/// Fault taxonomy. Each kind carries its own severity default, retry ladder,
/// and recovery budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WorkerStartup,
    WorkerRuntime,
    Communication,
    Memory,
    Timeout,
    Configuration,
    ExternalService,
    Unknown,
}

impl ErrorKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::WorkerStartup | ErrorKind::Memory | ErrorKind::Configuration => {
                Severity::High
            }
            _ => Severity::Medium,
        }
    }

    pub fn max_recovery_attempts(&self) -> u32 {
        match self {
            ErrorKind::WorkerStartup => 3,
            ErrorKind::WorkerRuntime => 3,
            ErrorKind::Communication => 5,
            ErrorKind::Memory => 2,
            ErrorKind::Timeout => 3,
            ErrorKind::Configuration => 1,
            ErrorKind::ExternalService => 3,
            ErrorKind::Unknown => 2,
        }
    }

    /// Per-attempt retry delays; attempts beyond the ladder reuse the last rung.
    pub fn retry_delays(&self) -> &'static [Duration] {
        match self {
            ErrorKind::Communication => COMM_RETRY_DELAYS,
            ErrorKind::Timeout => TIMEOUT_RETRY_DELAYS,
            ErrorKind::Unknown => UNKNOWN_RETRY_DELAYS,
            _ => DEFAULT_RETRY_DELAYS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::WorkerStartup => "worker_startup",
            ErrorKind::WorkerRuntime => "worker_runtime",
            ErrorKind::Communication => "communication",
            ErrorKind::Memory => "memory",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Configuration => "configuration",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the handler does about a classified fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Ignore,
    Retry,
    RestartWorker,
    Escalate,
    CircuitBreak,
}

/// Which side of the system reported the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Worker,
    Communication,
    External,
}

/// Optional hints attached by the reporting site; used as a classification
/// fallback when the message text is inconclusive.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub source: Option<ErrorSource>,
    pub operation: Option<String>,
    pub service: Option<String>,
}

impl ErrorContext {
    pub fn worker() -> Self {
        Self {
            source: Some(ErrorSource::Worker),
            ..Self::default()
        }
    }

    pub fn communication() -> Self {
        Self {
            source: Some(ErrorSource::Communication),
            ..Self::default()
        }
    }

    pub fn external(service: impl Into<String>) -> Self {
        Self {
            source: Some(ErrorSource::External),
            service: Some(service.into()),
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// One classified fault and its recovery state.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub operation: Option<String>,
    pub service: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub recovery_attempts: u32,
    pub recovery_exhausted: bool,
}

/// Aggregate view over the retained history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub last_window: usize,
    pub by_kind: HashMap<ErrorKind, usize>,
    pub by_severity: HashMap<Severity, usize>,
    pub most_frequent: Option<ErrorKind>,
}

/// Classifies a fault message, preferring the most specific signal.
pub fn classify(message: &str, context: &ErrorContext) -> ErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        return ErrorKind::Timeout;
    }
    if lower.contains("memory") || lower.contains("heap") {
        return ErrorKind::Memory;
    }
    if lower.contains("config") {
        return ErrorKind::Configuration;
    }
    if lower.contains("worker") && (lower.contains("spawn") || lower.contains("start")) {
        return ErrorKind::WorkerStartup;
    }
    if lower.contains("worker")
        && (lower.contains("exit") || lower.contains("crash") || lower.contains("panic"))
    {
        return ErrorKind::WorkerRuntime;
    }
    if lower.contains("database") || lower.contains("sink") || lower.contains("persistence") {
        return ErrorKind::ExternalService;
    }
    if lower.contains("connection")
        || lower.contains("channel")
        || lower.contains("modbus")
        || lower.contains("transport")
    {
        return ErrorKind::Communication;
    }
    if lower.contains("worker") {
        return ErrorKind::WorkerRuntime;
    }

    match context.source {
        Some(ErrorSource::Worker) => ErrorKind::WorkerRuntime,
        Some(ErrorSource::Communication) => ErrorKind::Communication,
        Some(ErrorSource::External) => ErrorKind::ExternalService,
        None => ErrorKind::Unknown,
    }
}

/// Maps a classified fault to its recovery strategy. Severity escalation wins
/// over the kind mapping.
pub fn strategy_for(kind: ErrorKind, severity: Severity) -> RecoveryStrategy {
    if severity == Severity::Critical {
        return RecoveryStrategy::Escalate;
    }
    match kind {
        ErrorKind::WorkerStartup | ErrorKind::WorkerRuntime | ErrorKind::Memory => {
            RecoveryStrategy::RestartWorker
        }
        ErrorKind::Communication | ErrorKind::Timeout | ErrorKind::Unknown => {
            RecoveryStrategy::Retry
        }
        ErrorKind::Configuration => RecoveryStrategy::Escalate,
        ErrorKind::ExternalService => RecoveryStrategy::CircuitBreak,
    }
}

pub struct ErrorHandler {
    config: Arc<ConfigManager>,
    events: EventBus,
    history: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorHandler {
    pub fn new(config: Arc<ConfigManager>, events: EventBus) -> Self {
        Self {
            config,
            events,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Classifies, records, announces, and kicks off recovery for a fault.
    /// Returns the record as it stands after the first recovery dispatch.
    pub fn handle_error(&self, message: impl Into<String>, context: ErrorContext) -> ErrorRecord {
        let message = message.into();
        let kind = classify(&message, &context);
        let severity = kind.default_severity();
        let strategy = strategy_for(kind, severity);

        let record = ErrorRecord {
            id: Uuid::new_v4(),
            kind,
            severity,
            strategy,
            message: message.clone(),
            operation: context.operation.clone(),
            service: context.service.clone(),
            occurred_at: Utc::now(),
            recovery_attempts: 0,
            recovery_exhausted: false,
        };

        match severity {
            Severity::Low => debug!(kind = kind.as_str(), "{}", message),
            Severity::Medium => warn!(kind = kind.as_str(), "{}", message),
            Severity::High | Severity::Critical => error!(kind = kind.as_str(), "{}", message),
        }
        metrics::counter!("metervisor_errors_total", "kind" => kind.as_str()).increment(1);

        let id = record.id;
        {
            let mut history = self.history.lock();
            history.push_back(record.clone());
            let cap = self.config.current().error_handler.max_history;
            while history.len() > cap {
                history.pop_front();
            }
        }

        if strategy != RecoveryStrategy::Ignore {
            self.attempt_recovery(id);
        }

        self.record(id).unwrap_or(record)
    }

    /// Runs one recovery attempt for a record. Returns false once the kind's
    /// budget is exhausted.
    pub fn attempt_recovery(&self, id: Uuid) -> bool {
        let (kind, strategy, attempt, service) = {
            let mut history = self.history.lock();
            let Some(record) = history.iter_mut().find(|r| r.id == id) else {
                return false;
            };

            if record.recovery_attempts >= record.kind.max_recovery_attempts() {
                // the event fires on every over-budget attempt so late
                // subscribers still see the exhaustion; the log stays one-shot
                if !record.recovery_exhausted {
                    record.recovery_exhausted = true;
                    warn!(
                        kind = record.kind.as_str(),
                        attempts = record.recovery_attempts,
                        "Recovery budget exhausted for {}",
                        record.message
                    );
                }
                self.events
                    .emit(SupervisorEvent::RecoveryExhausted { record_id: id });
                return false;
            }

            record.recovery_attempts += 1;
            (
                record.kind,
                record.strategy,
                record.recovery_attempts,
                record.service.clone(),
            )
        };

        match strategy {
            RecoveryStrategy::Ignore => {}
            RecoveryStrategy::Retry => {
                let delays = kind.retry_delays();
                let delay = delays[(attempt as usize - 1).min(delays.len() - 1)];
                info!(
                    kind = kind.as_str(),
                    attempt, "Scheduling retry in {:?}", delay
                );
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    events.emit(SupervisorEvent::RetryRequested {
                        record_id: id,
                        attempt,
                        delay,
                    });
                });
            }
            RecoveryStrategy::RestartWorker => {
                info!(kind = kind.as_str(), attempt, "Requesting worker restart");
                self.events.emit(SupervisorEvent::RestartRequested {
                    reason: RestartReason::WorkerFault,
                });
            }
            RecoveryStrategy::Escalate => {
                let message = self
                    .record(id)
                    .map(|r| r.message)
                    .unwrap_or_else(|| "unknown error".to_string());
                error!(kind = kind.as_str(), "Escalating: {}", message);
                self.events.emit(SupervisorEvent::EscalationRaised {
                    record_id: id,
                    message,
                });
            }
            RecoveryStrategy::CircuitBreak => {
                let service = service.unwrap_or_else(|| "external".to_string());
                warn!(service = %service, "Tripping circuit breaker");
                self.events
                    .emit(SupervisorEvent::CircuitBreakerActivated { service });
            }
        }

        true
    }

    pub fn record(&self, id: Uuid) -> Option<ErrorRecord> {
        self.history.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> ErrorStats {
        let history = self.history.lock();
        let window = Duration::from_secs(self.config.current().error_handler.rolling_window_secs);
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();

        let mut by_kind: HashMap<ErrorKind, usize> = HashMap::new();
        let mut by_severity: HashMap<Severity, usize> = HashMap::new();
        let mut last_window = 0;

        for record in history.iter() {
            *by_kind.entry(record.kind).or_default() += 1;
            *by_severity.entry(record.severity).or_default() += 1;
            if record.occurred_at >= cutoff {
                last_window += 1;
            }
        }

        let most_frequent = by_kind
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(kind, _)| *kind);

        ErrorStats {
            total: history.len(),
            last_window,
            by_kind,
            by_severity,
            most_frequent,
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSource, ConfigUpdate, ErrorHandlerUpdate};

    fn handler() -> ErrorHandler {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        ErrorHandler::new(config, events)
    }

    #[test]
    fn test_classification_prefers_specific_signals() {
        let ctx = ErrorContext::default();
        assert_eq!(classify("ping request timed out after 3s", &ctx), ErrorKind::Timeout);
        assert_eq!(classify("heap usage above limit", &ctx), ErrorKind::Memory);
        assert_eq!(classify("invalid config document", &ctx), ErrorKind::Configuration);
        assert_eq!(classify("worker spawn failed: oom", &ctx), ErrorKind::WorkerStartup);
        assert_eq!(
            classify("worker exited unexpectedly: response channel closed", &ctx),
            ErrorKind::WorkerRuntime
        );
        assert_eq!(classify("sink write rejected", &ctx), ErrorKind::ExternalService);
        assert_eq!(classify("modbus connection refused", &ctx), ErrorKind::Communication);
    }

    #[test]
    fn test_context_fallback_when_message_is_opaque() {
        assert_eq!(
            classify("something broke", &ErrorContext::worker()),
            ErrorKind::WorkerRuntime
        );
        assert_eq!(
            classify("something broke", &ErrorContext::external("db")),
            ErrorKind::ExternalService
        );
        assert_eq!(
            classify("something broke", &ErrorContext::default()),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            strategy_for(ErrorKind::WorkerRuntime, Severity::Medium),
            RecoveryStrategy::RestartWorker
        );
        assert_eq!(
            strategy_for(ErrorKind::Communication, Severity::Medium),
            RecoveryStrategy::Retry
        );
        assert_eq!(
            strategy_for(ErrorKind::Configuration, Severity::High),
            RecoveryStrategy::Escalate
        );
        assert_eq!(
            strategy_for(ErrorKind::ExternalService, Severity::Medium),
            RecoveryStrategy::CircuitBreak
        );
        // critical always escalates
        assert_eq!(
            strategy_for(ErrorKind::Communication, Severity::Critical),
            RecoveryStrategy::Escalate
        );
    }

    #[tokio::test]
    async fn test_recovery_budget_exhausts_once() {
        let handler = handler();
        let record = handler.handle_error(
            "modbus connection refused",
            ErrorContext::communication(),
        );
        // first dispatch already ran inside handle_error
        assert_eq!(record.recovery_attempts, 1);

        let budget = ErrorKind::Communication.max_recovery_attempts();
        for _ in 1..budget {
            assert!(handler.attempt_recovery(record.id));
        }
        assert!(!handler.attempt_recovery(record.id));
        assert!(handler.record(record.id).unwrap().recovery_exhausted);
        // further attempts stay no-ops
        assert!(!handler.attempt_recovery(record.id));
    }

    #[tokio::test]
    async fn test_exhaustion_event_fires_on_every_over_budget_attempt() {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        let handler = ErrorHandler::new(config, events.clone());

        // configuration errors get a budget of one, spent inside handle_error
        let record = handler.handle_error("invalid config document", ErrorContext::default());
        assert_eq!(record.kind, ErrorKind::Configuration);

        let mut rx = events.subscribe();
        assert!(!handler.attempt_recovery(record.id));
        assert!(!handler.attempt_recovery(record.id));

        let mut exhausted_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SupervisorEvent::RecoveryExhausted { record_id } if record_id == record.id)
            {
                exhausted_events += 1;
            }
        }
        assert_eq!(exhausted_events, 2);
    }

    #[tokio::test]
    async fn test_restart_strategy_emits_restart_request() {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        let handler = ErrorHandler::new(config, events.clone());
        let mut rx = events.subscribe();

        handler.handle_error("worker exited with panic", ErrorContext::worker());

        let mut saw_restart = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                SupervisorEvent::RestartRequested {
                    reason: RestartReason::WorkerFault
                }
            ) {
                saw_restart = true;
            }
        }
        assert!(saw_restart);
    }

    #[tokio::test]
    async fn test_history_is_bounded_by_config() {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        config
            .update(
                ConfigUpdate {
                    error_handler: Some(ErrorHandlerUpdate {
                        max_history: Some(5),
                        ..ErrorHandlerUpdate::default()
                    }),
                    ..ConfigUpdate::default()
                },
                ConfigSource::Api,
            )
            .unwrap();
        let handler = ErrorHandler::new(config, events);

        for i in 0..12 {
            handler.handle_error(format!("fault {}", i), ErrorContext::default());
        }
        assert_eq!(handler.stats().total, 5);
        // newest retained
        assert_eq!(handler.recent(1)[0].message, "fault 11");
    }

    #[tokio::test]
    async fn test_stats_counts_by_kind() {
        let handler = handler();
        handler.handle_error("modbus connection refused", ErrorContext::default());
        handler.handle_error("modbus connection refused again", ErrorContext::default());
        handler.handle_error("status request timed out", ErrorContext::default());

        let stats = handler.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind[&ErrorKind::Communication], 2);
        assert_eq!(stats.by_kind[&ErrorKind::Timeout], 1);
        assert_eq!(stats.most_frequent, Some(ErrorKind::Communication));
        assert_eq!(stats.last_window, 3);
    }
}
