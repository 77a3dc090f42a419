//! Configuration management: the validated tree, hot updates, and file/env sources.
//!
//! The tree is fully defaulted so no component ever observes a partially
//! defined section. Updates are partial documents validated section-by-section
//! and applied all-or-nothing through field-wise merges; every accepted
//! mutation lands in a bounded change-history log tagged with its source.

use crate::event::{EventBus, SupervisorEvent};
use crate::message::DeviceDescriptor;
use config::{Config, Environment, File};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_CHANGE_HISTORY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("invalid config document: {0}")]
    Document(String),

    #[error("config source error: {0}")]
    Source(#[from] config::ConfigError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Where an accepted configuration mutation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Api,
    File,
    Environment,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ConfigSource::Api => "api",
            ConfigSource::File => "file",
            ConfigSource::Environment => "environment",
            ConfigSource::Default => "default",
        };
        write!(f, "{}", tag)
    }
}

/// The full configuration tree covering every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub thread_manager: ThreadManagerConfig,
    pub health_monitor: HealthMonitorConfig,
    pub restart_manager: RestartManagerConfig,
    pub error_handler: ErrorHandlerConfig,
    pub resource_monitor: ResourceMonitorConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            thread_manager: ThreadManagerConfig::default(),
            health_monitor: HealthMonitorConfig::default(),
            restart_manager: RestartManagerConfig::default(),
            error_handler: ErrorHandlerConfig::default(),
            resource_monitor: ResourceMonitorConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadManagerConfig {
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ThreadManagerConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: default_message_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_channel_capacity() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    #[serde(default = "default_max_missed_checks")]
    pub max_missed_checks: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            check_timeout_ms: default_check_timeout_ms(),
            max_missed_checks: default_max_missed_checks(),
        }
    }
}

fn default_check_interval_ms() -> u64 {
    10_000
}

fn default_check_timeout_ms() -> u64 {
    3_000
}

fn default_max_missed_checks() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartManagerConfig {
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_restart_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: usize,
    #[serde(default = "default_breaker_open_ms")]
    pub breaker_open_ms: u64,
    #[serde(default = "default_breaker_half_open_successes")]
    pub breaker_half_open_successes: usize,
}

impl Default for RestartManagerConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restart_attempts(),
            base_delay_ms: default_restart_base_delay_ms(),
            max_delay_ms: default_restart_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_open_ms: default_breaker_open_ms(),
            breaker_half_open_successes: default_breaker_half_open_successes(),
        }
    }
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_restart_base_delay_ms() -> u64 {
    1_000
}

fn default_restart_max_delay_ms() -> u64 {
    60_000
}

fn default_breaker_failure_threshold() -> usize {
    5
}

fn default_breaker_open_ms() -> u64 {
    300_000
}

fn default_breaker_half_open_successes() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    #[serde(default = "default_error_max_history")]
    pub max_history: usize,
    #[serde(default = "default_rolling_window_secs")]
    pub rolling_window_secs: u64,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            max_history: default_error_max_history(),
            rolling_window_secs: default_rolling_window_secs(),
        }
    }
}

fn default_error_max_history() -> usize {
    500
}

fn default_rolling_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMonitorConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_sample_max_history")]
    pub max_history: usize,
    #[serde(default = "default_warning_memory_mb")]
    pub warning_memory_mb: f64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default = "default_limit_grace_ms")]
    pub limit_grace_ms: u64,
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    #[serde(default = "default_trend_hysteresis_pct")]
    pub trend_hysteresis_pct: f64,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            max_history: default_sample_max_history(),
            warning_memory_mb: default_warning_memory_mb(),
            max_memory_mb: default_max_memory_mb(),
            auto_restart: default_auto_restart(),
            limit_grace_ms: default_limit_grace_ms(),
            trend_window: default_trend_window(),
            trend_hysteresis_pct: default_trend_hysteresis_pct(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }
}

fn default_sample_interval_ms() -> u64 {
    30_000
}

fn default_sample_max_history() -> usize {
    120
}

fn default_warning_memory_mb() -> f64 {
    300.0
}

fn default_max_memory_mb() -> f64 {
    512.0
}

fn default_auto_restart() -> bool {
    true
}

fn default_limit_grace_ms() -> u64 {
    10_000
}

fn default_trend_window() -> usize {
    10
}

fn default_trend_hysteresis_pct() -> f64 {
    0.05
}

fn default_gc_interval_ms() -> u64 {
    0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            devices: Vec::new(),
            sink: SinkConfig::default(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sink_path")]
    pub path: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: default_sink_enabled(),
            path: default_sink_path(),
        }
    }
}

fn default_sink_enabled() -> bool {
    true
}

fn default_sink_path() -> String {
    "./data/readings.jsonl".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_json")]
    pub log_json: bool,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_json: default_log_json(),
            metrics_enabled: default_metrics_enabled(),
            metrics_bind: default_metrics_bind(),
        }
    }
}

fn default_log_json() -> bool {
    false
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9464".to_string()
}

/// Partial configuration document; omitted fields keep their current values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub thread_manager: Option<ThreadManagerUpdate>,
    pub health_monitor: Option<HealthMonitorUpdate>,
    pub restart_manager: Option<RestartManagerUpdate>,
    pub error_handler: Option<ErrorHandlerUpdate>,
    pub resource_monitor: Option<ResourceMonitorUpdate>,
    pub worker: Option<WorkerUpdate>,
    pub logging: Option<LoggingUpdate>,
    pub observability: Option<ObservabilityUpdate>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ConfigUpdate::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadManagerUpdate {
    pub message_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorUpdate {
    pub check_interval_ms: Option<u64>,
    pub check_timeout_ms: Option<u64>,
    pub max_missed_checks: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartManagerUpdate {
    pub max_restart_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub breaker_failure_threshold: Option<usize>,
    pub breaker_open_ms: Option<u64>,
    pub breaker_half_open_successes: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerUpdate {
    pub max_history: Option<usize>,
    pub rolling_window_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMonitorUpdate {
    pub sample_interval_ms: Option<u64>,
    pub max_history: Option<usize>,
    pub warning_memory_mb: Option<f64>,
    pub max_memory_mb: Option<f64>,
    pub auto_restart: Option<bool>,
    pub limit_grace_ms: Option<u64>,
    pub trend_window: Option<usize>,
    pub trend_hysteresis_pct: Option<f64>,
    pub gc_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerUpdate {
    pub poll_interval_ms: Option<u64>,
    pub devices: Option<Vec<DeviceDescriptor>>,
    pub sink: Option<SinkUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkUpdate {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingUpdate {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityUpdate {
    pub log_json: Option<bool>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind: Option<String>,
}

fn merge_thread_manager(current: &mut ThreadManagerConfig, update: &ThreadManagerUpdate) {
    if let Some(v) = update.message_timeout_ms {
        current.message_timeout_ms = v;
    }
    if let Some(v) = update.shutdown_grace_ms {
        current.shutdown_grace_ms = v;
    }
    if let Some(v) = update.channel_capacity {
        current.channel_capacity = v;
    }
}

fn merge_health_monitor(current: &mut HealthMonitorConfig, update: &HealthMonitorUpdate) {
    if let Some(v) = update.check_interval_ms {
        current.check_interval_ms = v;
    }
    if let Some(v) = update.check_timeout_ms {
        current.check_timeout_ms = v;
    }
    if let Some(v) = update.max_missed_checks {
        current.max_missed_checks = v;
    }
}

fn merge_restart_manager(current: &mut RestartManagerConfig, update: &RestartManagerUpdate) {
    if let Some(v) = update.max_restart_attempts {
        current.max_restart_attempts = v;
    }
    if let Some(v) = update.base_delay_ms {
        current.base_delay_ms = v;
    }
    if let Some(v) = update.max_delay_ms {
        current.max_delay_ms = v;
    }
    if let Some(v) = update.breaker_failure_threshold {
        current.breaker_failure_threshold = v;
    }
    if let Some(v) = update.breaker_open_ms {
        current.breaker_open_ms = v;
    }
    if let Some(v) = update.breaker_half_open_successes {
        current.breaker_half_open_successes = v;
    }
}

fn merge_error_handler(current: &mut ErrorHandlerConfig, update: &ErrorHandlerUpdate) {
    if let Some(v) = update.max_history {
        current.max_history = v;
    }
    if let Some(v) = update.rolling_window_secs {
        current.rolling_window_secs = v;
    }
}

fn merge_resource_monitor(current: &mut ResourceMonitorConfig, update: &ResourceMonitorUpdate) {
    if let Some(v) = update.sample_interval_ms {
        current.sample_interval_ms = v;
    }
    if let Some(v) = update.max_history {
        current.max_history = v;
    }
    if let Some(v) = update.warning_memory_mb {
        current.warning_memory_mb = v;
    }
    if let Some(v) = update.max_memory_mb {
        current.max_memory_mb = v;
    }
    if let Some(v) = update.auto_restart {
        current.auto_restart = v;
    }
    if let Some(v) = update.limit_grace_ms {
        current.limit_grace_ms = v;
    }
    if let Some(v) = update.trend_window {
        current.trend_window = v;
    }
    if let Some(v) = update.trend_hysteresis_pct {
        current.trend_hysteresis_pct = v;
    }
    if let Some(v) = update.gc_interval_ms {
        current.gc_interval_ms = v;
    }
}

fn merge_worker(current: &mut WorkerConfig, update: &WorkerUpdate) {
    if let Some(v) = update.poll_interval_ms {
        current.poll_interval_ms = v;
    }
    if let Some(v) = &update.devices {
        current.devices = v.clone();
    }
    if let Some(sink) = &update.sink {
        if let Some(v) = sink.enabled {
            current.sink.enabled = v;
        }
        if let Some(v) = &sink.path {
            current.sink.path = v.clone();
        }
    }
}

fn merge_logging(current: &mut LoggingConfig, update: &LoggingUpdate) {
    if let Some(v) = &update.level {
        current.level = v.clone();
    }
}

fn merge_observability(current: &mut ObservabilityConfig, update: &ObservabilityUpdate) {
    if let Some(v) = update.log_json {
        current.log_json = v;
    }
    if let Some(v) = update.metrics_enabled {
        current.metrics_enabled = v;
    }
    if let Some(v) = &update.metrics_bind {
        current.metrics_bind = v.clone();
    }
}

fn apply_update(tree: &mut SupervisorConfig, update: &ConfigUpdate) {
    if let Some(section) = &update.thread_manager {
        merge_thread_manager(&mut tree.thread_manager, section);
    }
    if let Some(section) = &update.health_monitor {
        merge_health_monitor(&mut tree.health_monitor, section);
    }
    if let Some(section) = &update.restart_manager {
        merge_restart_manager(&mut tree.restart_manager, section);
    }
    if let Some(section) = &update.error_handler {
        merge_error_handler(&mut tree.error_handler, section);
    }
    if let Some(section) = &update.resource_monitor {
        merge_resource_monitor(&mut tree.resource_monitor, section);
    }
    if let Some(section) = &update.worker {
        merge_worker(&mut tree.worker, section);
    }
    if let Some(section) = &update.logging {
        merge_logging(&mut tree.logging, section);
    }
    if let Some(section) = &update.observability {
        merge_observability(&mut tree.observability, section);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn validate(tree: &SupervisorConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    let tm = &tree.thread_manager;
    if tm.message_timeout_ms < 100 {
        report
            .errors
            .push("thread_manager.message_timeout_ms must be at least 100".to_string());
    }
    if tm.shutdown_grace_ms == 0 {
        report
            .errors
            .push("thread_manager.shutdown_grace_ms must be positive".to_string());
    }
    if tm.channel_capacity == 0 {
        report
            .errors
            .push("thread_manager.channel_capacity must be positive".to_string());
    }

    let hm = &tree.health_monitor;
    if hm.check_interval_ms < 1_000 {
        report
            .errors
            .push("health_monitor.check_interval_ms must be at least 1000".to_string());
    }
    if hm.check_timeout_ms < 100 {
        report
            .errors
            .push("health_monitor.check_timeout_ms must be at least 100".to_string());
    }
    if hm.max_missed_checks == 0 {
        report
            .errors
            .push("health_monitor.max_missed_checks must be positive".to_string());
    }
    if hm.check_timeout_ms >= hm.check_interval_ms {
        report.warnings.push(
            "health_monitor.check_timeout_ms is not shorter than the check interval".to_string(),
        );
    }

    let rm = &tree.restart_manager;
    if rm.max_restart_attempts == 0 {
        report
            .errors
            .push("restart_manager.max_restart_attempts must be positive".to_string());
    }
    if rm.base_delay_ms == 0 {
        report
            .errors
            .push("restart_manager.base_delay_ms must be positive".to_string());
    }
    if rm.max_delay_ms < rm.base_delay_ms {
        report
            .errors
            .push("restart_manager.max_delay_ms must not be below base_delay_ms".to_string());
    }
    if rm.breaker_failure_threshold == 0 {
        report
            .errors
            .push("restart_manager.breaker_failure_threshold must be positive".to_string());
    }
    if rm.breaker_half_open_successes == 0 {
        report
            .errors
            .push("restart_manager.breaker_half_open_successes must be positive".to_string());
    }

    let eh = &tree.error_handler;
    if eh.max_history == 0 {
        report
            .errors
            .push("error_handler.max_history must be positive".to_string());
    }
    if eh.rolling_window_secs == 0 {
        report
            .errors
            .push("error_handler.rolling_window_secs must be positive".to_string());
    }

    let res = &tree.resource_monitor;
    if res.sample_interval_ms < 1_000 {
        report
            .errors
            .push("resource_monitor.sample_interval_ms must be at least 1000".to_string());
    }
    if res.max_history < 2 {
        report
            .errors
            .push("resource_monitor.max_history must be at least 2".to_string());
    }
    if res.warning_memory_mb <= 0.0 || res.max_memory_mb <= 0.0 {
        report
            .errors
            .push("resource_monitor memory thresholds must be positive".to_string());
    }
    if res.warning_memory_mb >= res.max_memory_mb {
        report.errors.push(
            "resource_monitor.warning_memory_mb must be below max_memory_mb".to_string(),
        );
    }
    if res.trend_window < 2 {
        report
            .errors
            .push("resource_monitor.trend_window must be at least 2".to_string());
    } else if res.trend_window < 4 {
        report
            .warnings
            .push("resource_monitor.trend_window below 4 makes trend detection noisy".to_string());
    }
    if !(0.0..1.0).contains(&res.trend_hysteresis_pct) {
        report
            .errors
            .push("resource_monitor.trend_hysteresis_pct must be in [0, 1)".to_string());
    }

    let worker = &tree.worker;
    if worker.poll_interval_ms < 1_000 {
        report
            .errors
            .push("worker.poll_interval_ms must be at least 1000".to_string());
    }
    for device in &worker.devices {
        if device.name.trim().is_empty() {
            report
                .errors
                .push("worker.devices entries must have a non-empty name".to_string());
        }
        if device.port == 0 {
            report
                .errors
                .push(format!("worker device {} has port 0", device.name));
        }
    }

    if tracing_subscriber::EnvFilter::try_new(&tree.logging.level).is_err() {
        report.warnings.push(format!(
            "logging.level {:?} is not a valid filter directive",
            tree.logging.level
        ));
    }

    let obs = &tree.observability;
    if obs.metrics_enabled && obs.metrics_bind.parse::<std::net::SocketAddr>().is_err() {
        report.errors.push(format!(
            "observability.metrics_bind {:?} is not a valid socket address",
            obs.metrics_bind
        ));
    }

    report
}

/// One accepted mutation of a configuration section.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigChange {
    pub section: String,
    pub source: ConfigSource,
    pub changed_at: chrono::DateTime<chrono::Utc>,
    pub previous: serde_json::Value,
    pub current: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub version: u64,
    pub changed_sections: Vec<&'static str>,
    pub warnings: Vec<String>,
}

/// Holds the versioned tree and serializes all mutations.
///
/// Readers get deep copies via [`ConfigManager::current`]; no reader ever
/// observes a partially applied update.
pub struct ConfigManager {
    tree: RwLock<SupervisorConfig>,
    defaults: SupervisorConfig,
    history: Mutex<VecDeque<ConfigChange>>,
    version: AtomicU64,
    events: EventBus,
    // serializes writers end to end; API callers and the file-watcher
    // thread must not interleave snapshot/merge/swap
    write_lock: Mutex<()>,
}

impl ConfigManager {
    pub fn new(events: EventBus) -> Self {
        Self::with_defaults(SupervisorConfig::default(), events)
    }

    pub fn with_defaults(defaults: SupervisorConfig, events: EventBus) -> Self {
        Self {
            tree: RwLock::new(defaults.clone()),
            defaults,
            history: Mutex::new(VecDeque::new()),
            version: AtomicU64::new(0),
            events,
            write_lock: Mutex::new(()),
        }
    }

    /// Deep copy of the live tree.
    pub fn current(&self) -> SupervisorConfig {
        self.tree.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Validates and applies a partial update. All-or-nothing: any validation
    /// error leaves the live tree untouched.
    pub fn update(
        &self,
        update: ConfigUpdate,
        source: ConfigSource,
    ) -> ConfigResult<UpdateOutcome> {
        let _writer = self.write_lock.lock();

        let mut candidate = self.current();
        apply_update(&mut candidate, &update);

        let report = validate(&candidate);
        for warning in &report.warnings {
            warn!("Config warning: {}", warning);
        }
        if !report.errors.is_empty() {
            return Err(ConfigError::Validation {
                errors: report.errors,
            });
        }

        let changed = {
            let mut tree = self.tree.write();
            let changed = diff_sections(&tree, &candidate)?;
            *tree = candidate;
            changed
        };

        if changed.is_empty() {
            debug!("Config update from {} changed nothing", source);
            return Ok(UpdateOutcome {
                version: self.version(),
                changed_sections: Vec::new(),
                warnings: report.warnings,
            });
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let changed_sections: Vec<&'static str> =
            changed.iter().map(|(name, _, _)| *name).collect();

        {
            let mut history = self.history.lock();
            for (section, previous, current) in changed {
                history.push_back(ConfigChange {
                    section: section.to_string(),
                    source,
                    changed_at: chrono::Utc::now(),
                    previous,
                    current,
                });
                self.events.emit(SupervisorEvent::ConfigSectionChanged { section, source });
            }
            while history.len() > MAX_CHANGE_HISTORY {
                history.pop_front();
            }
        }

        info!(
            "Config updated from {}: sections {:?} (version {})",
            source, changed_sections, version
        );
        self.events
            .emit(SupervisorEvent::ConfigApplied { version, source });

        Ok(UpdateOutcome {
            version,
            changed_sections,
            warnings: report.warnings,
        })
    }

    /// Restores the seed tree. The reset is an accepted mutation like any
    /// other, so every reverted section lands in the change history tagged
    /// with the `Default` source.
    pub fn reset_to_defaults(&self) {
        let _writer = self.write_lock.lock();

        let changed = {
            let mut tree = self.tree.write();
            let changed = diff_sections(&tree, &self.defaults).unwrap_or_default();
            *tree = self.defaults.clone();
            changed
        };

        {
            let mut history = self.history.lock();
            for (section, previous, current) in changed {
                history.push_back(ConfigChange {
                    section: section.to_string(),
                    source: ConfigSource::Default,
                    changed_at: chrono::Utc::now(),
                    previous,
                    current,
                });
            }
            while history.len() > MAX_CHANGE_HISTORY {
                history.pop_front();
            }
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Config reset to defaults (version {})", version);
        self.events.emit(SupervisorEvent::ConfigReset);
    }

    /// Serializes the live tree into a self-describing document.
    pub fn export(&self) -> ConfigResult<serde_json::Value> {
        serde_json::to_value(self.current()).map_err(|e| ConfigError::Document(e.to_string()))
    }

    /// Parses a document into a partial update and applies it through the
    /// normal validation path.
    pub fn import(
        &self,
        document: serde_json::Value,
        source: ConfigSource,
    ) -> ConfigResult<UpdateOutcome> {
        let update: ConfigUpdate =
            serde_json::from_value(document).map_err(|e| ConfigError::Document(e.to_string()))?;
        self.update(update, source)
    }

    pub fn change_history(&self) -> Vec<ConfigChange> {
        self.history.lock().iter().cloned().collect()
    }
}

type SectionDiff = (&'static str, serde_json::Value, serde_json::Value);

fn diff_sections(
    previous: &SupervisorConfig,
    next: &SupervisorConfig,
) -> ConfigResult<Vec<SectionDiff>> {
    fn to_value<T: Serialize>(section: &T) -> ConfigResult<serde_json::Value> {
        serde_json::to_value(section).map_err(|e| ConfigError::Document(e.to_string()))
    }

    let mut out = Vec::new();
    if previous.thread_manager != next.thread_manager {
        out.push((
            "thread_manager",
            to_value(&previous.thread_manager)?,
            to_value(&next.thread_manager)?,
        ));
    }
    if previous.health_monitor != next.health_monitor {
        out.push((
            "health_monitor",
            to_value(&previous.health_monitor)?,
            to_value(&next.health_monitor)?,
        ));
    }
    if previous.restart_manager != next.restart_manager {
        out.push((
            "restart_manager",
            to_value(&previous.restart_manager)?,
            to_value(&next.restart_manager)?,
        ));
    }
    if previous.error_handler != next.error_handler {
        out.push((
            "error_handler",
            to_value(&previous.error_handler)?,
            to_value(&next.error_handler)?,
        ));
    }
    if previous.resource_monitor != next.resource_monitor {
        out.push((
            "resource_monitor",
            to_value(&previous.resource_monitor)?,
            to_value(&next.resource_monitor)?,
        ));
    }
    if previous.worker != next.worker {
        out.push(("worker", to_value(&previous.worker)?, to_value(&next.worker)?));
    }
    if previous.logging != next.logging {
        out.push((
            "logging",
            to_value(&previous.logging)?,
            to_value(&next.logging)?,
        ));
    }
    if previous.observability != next.observability {
        out.push((
            "observability",
            to_value(&previous.observability)?,
            to_value(&next.observability)?,
        ));
    }
    Ok(out)
}

/// Loads a partial update from an optional TOML file layered with
/// `METERVISOR__`-prefixed environment variables.
pub fn load_update_from_sources(path: Option<&Path>) -> ConfigResult<ConfigUpdate> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix("METERVISOR")
            .separator("__")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    settings
        .try_deserialize::<ConfigUpdate>()
        .map_err(ConfigError::from)
}

/// Watches a config file and feeds accepted reloads through the manager.
pub fn watch_config_file(manager: Arc<ConfigManager>, path: PathBuf) {
    std::thread::spawn(move || {
        if let Err(err) = watch_loop(manager, path) {
            warn!("Config watch stopped: {}", err);
        }
    });
}

fn watch_loop(manager: Arc<ConfigManager>, path: PathBuf) -> ConfigResult<()> {
    let (notify_tx, notify_rx) = channel();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        let _ = notify_tx.send(res);
    })
    .map_err(|e| ConfigError::Document(e.to_string()))?;

    watcher
        .watch(path.as_path(), RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::Document(e.to_string()))?;

    info!("Watching config file {:?}", path);

    loop {
        match notify_rx.recv() {
            Ok(Ok(event)) => {
                if !should_reload(&event.kind) {
                    continue;
                }

                debug!("Config change detected: {:?}", event.kind);
                std::thread::sleep(Duration::from_millis(200));

                match load_update_from_sources(Some(path.as_path())) {
                    Ok(update) => match manager.update(update, ConfigSource::File) {
                        Ok(outcome) => {
                            if !outcome.changed_sections.is_empty() {
                                info!("Config reloaded (version {})", outcome.version);
                            }
                        }
                        Err(err) => warn!("Rejected config reload: {}", err),
                    },
                    Err(err) => warn!("Failed to reload config: {}", err),
                }
            }
            Ok(Err(err)) => {
                warn!("Config watch error: {}", err);
            }
            Err(_) => break,
        }
    }

    Ok(())
}

fn should_reload(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConfigManager {
        ConfigManager::new(EventBus::default())
    }

    #[test]
    fn test_defaults_are_valid() {
        let report = validate(&SupervisorConfig::default());
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_partial_update_merges_field_wise() {
        let manager = manager();
        let update = ConfigUpdate {
            health_monitor: Some(HealthMonitorUpdate {
                check_interval_ms: Some(2_000),
                ..HealthMonitorUpdate::default()
            }),
            ..ConfigUpdate::default()
        };

        let outcome = manager.update(update, ConfigSource::Api).unwrap();
        assert_eq!(outcome.changed_sections, vec!["health_monitor"]);

        let tree = manager.current();
        assert_eq!(tree.health_monitor.check_interval_ms, 2_000);
        // omitted sub-fields keep their defaults
        assert_eq!(
            tree.health_monitor.check_timeout_ms,
            default_check_timeout_ms()
        );
    }

    #[test]
    fn test_invalid_section_rejects_whole_update() {
        let manager = manager();
        let before = manager.current();

        let update = ConfigUpdate {
            thread_manager: Some(ThreadManagerUpdate {
                message_timeout_ms: Some(10_000),
                ..ThreadManagerUpdate::default()
            }),
            health_monitor: Some(HealthMonitorUpdate {
                check_interval_ms: Some(0),
                ..HealthMonitorUpdate::default()
            }),
            ..ConfigUpdate::default()
        };

        let err = manager.update(update, ConfigSource::Api).unwrap_err();
        match err {
            ConfigError::Validation { errors } => {
                assert!(errors.iter().any(|e| e.contains("check_interval_ms")));
            }
            other => panic!("unexpected error: {}", other),
        }

        // the valid thread_manager section must not have been applied either
        assert_eq!(manager.current(), before);
        assert!(manager.change_history().is_empty());
    }

    #[test]
    fn test_accepted_update_recorded_once_with_source() {
        let manager = manager();
        let update = ConfigUpdate {
            resource_monitor: Some(ResourceMonitorUpdate {
                max_memory_mb: Some(1024.0),
                ..ResourceMonitorUpdate::default()
            }),
            ..ConfigUpdate::default()
        };

        manager.update(update, ConfigSource::File).unwrap();

        let history = manager.change_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].section, "resource_monitor");
        assert_eq!(history[0].source, ConfigSource::File);
        assert_eq!(history[0].current["max_memory_mb"], 1024.0);
    }

    #[test]
    fn test_warning_threshold_must_stay_below_max() {
        let manager = manager();
        let update = ConfigUpdate {
            resource_monitor: Some(ResourceMonitorUpdate {
                warning_memory_mb: Some(600.0),
                ..ResourceMonitorUpdate::default()
            }),
            ..ConfigUpdate::default()
        };

        assert!(manager.update(update, ConfigSource::Api).is_err());
    }

    #[test]
    fn test_export_import_round_trip() {
        let manager = manager();
        manager
            .update(
                ConfigUpdate {
                    worker: Some(WorkerUpdate {
                        poll_interval_ms: Some(15_000),
                        ..WorkerUpdate::default()
                    }),
                    ..ConfigUpdate::default()
                },
                ConfigSource::Api,
            )
            .unwrap();

        let document = manager.export().unwrap();
        let other = ConfigManager::new(EventBus::default());
        other.import(document, ConfigSource::File).unwrap();

        assert_eq!(other.current(), manager.current());
    }

    #[test]
    fn test_import_runs_validation() {
        let manager = manager();
        let document = serde_json::json!({
            "worker": { "poll_interval_ms": 5 }
        });
        assert!(manager.import(document, ConfigSource::Api).is_err());
    }

    #[test]
    fn test_reset_restores_seed() {
        let manager = manager();
        manager
            .update(
                ConfigUpdate {
                    logging: Some(LoggingUpdate {
                        level: Some("debug".to_string()),
                    }),
                    ..ConfigUpdate::default()
                },
                ConfigSource::Environment,
            )
            .unwrap();

        manager.reset_to_defaults();
        assert_eq!(manager.current(), SupervisorConfig::default());
    }

    #[test]
    fn test_reset_lands_in_change_history() {
        let manager = manager();
        manager
            .update(
                ConfigUpdate {
                    logging: Some(LoggingUpdate {
                        level: Some("debug".to_string()),
                    }),
                    ..ConfigUpdate::default()
                },
                ConfigSource::Api,
            )
            .unwrap();

        manager.reset_to_defaults();

        let history = manager.change_history();
        let last = history.last().unwrap();
        assert_eq!(last.section, "logging");
        assert_eq!(last.source, ConfigSource::Default);
        assert_eq!(last.current["level"], "info");
    }

    #[test]
    fn test_concurrent_writers_keep_both_sections() {
        let manager = Arc::new(manager());

        let writer_a = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for i in 0..100u64 {
                    manager
                        .update(
                            ConfigUpdate {
                                thread_manager: Some(ThreadManagerUpdate {
                                    message_timeout_ms: Some(1_000 + i),
                                    ..ThreadManagerUpdate::default()
                                }),
                                ..ConfigUpdate::default()
                            },
                            ConfigSource::Api,
                        )
                        .unwrap();
                }
            })
        };
        let writer_b = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for i in 0..100u64 {
                    manager
                        .update(
                            ConfigUpdate {
                                health_monitor: Some(HealthMonitorUpdate {
                                    check_interval_ms: Some(2_000 + i),
                                    ..HealthMonitorUpdate::default()
                                }),
                                ..ConfigUpdate::default()
                            },
                            ConfigSource::File,
                        )
                        .unwrap();
                }
            })
        };
        writer_a.join().unwrap();
        writer_b.join().unwrap();

        // neither writer's final section may be reverted by the other
        let tree = manager.current();
        assert_eq!(tree.thread_manager.message_timeout_ms, 1_099);
        assert_eq!(tree.health_monitor.check_interval_ms, 2_099);
    }

    #[test]
    fn test_noop_update_records_nothing() {
        let manager = manager();
        let outcome = manager
            .update(ConfigUpdate::default(), ConfigSource::Api)
            .unwrap();
        assert!(outcome.changed_sections.is_empty());
        assert!(manager.change_history().is_empty());
    }
}
