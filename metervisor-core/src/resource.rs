//! Worker memory governance: sampling, thresholds, trend, limit enforcement.
//!
//! Samples come from two places: the periodic `Status` poll and heartbeat
//! replies forwarded by the health monitor. When the hard limit is crossed the
//! worker gets one grace window to recover before a restart is requested.

use crate::config::ConfigManager;
use crate::event::{EventBus, RestartReason, SupervisorEvent};
use crate::message::{MemoryReading, RequestBody, ResponseBody};
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const GC_RECHECK: Duration = Duration::from_secs(60);

/// One retained memory observation, in bytes plus a derived MB view.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    pub rss: u64,
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub array_buffers: u64,
    pub sampled_at: DateTime<Utc>,
}

impl MemorySample {
    pub fn from_reading(reading: MemoryReading) -> Self {
        Self {
            rss: reading.rss,
            heap_used: reading.heap_used,
            heap_total: reading.heap_total,
            external: reading.external,
            array_buffers: reading.array_buffers,
            sampled_at: Utc::now(),
        }
    }

    pub fn rss_mb(&self) -> f64 {
        self.rss as f64 / BYTES_PER_MB
    }

    pub fn heap_used_mb(&self) -> f64 {
        self.heap_used as f64 / BYTES_PER_MB
    }
}

/// Per-field high-water marks across all samples since the last clear.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryPeak {
    pub rss: u64,
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub array_buffers: u64,
}

impl MemoryPeak {
    fn absorb(&mut self, sample: &MemorySample) {
        self.rss = self.rss.max(sample.rss);
        self.heap_used = self.heap_used.max(sample.heap_used);
        self.heap_total = self.heap_total.max(sample.heap_total);
        self.external = self.external.max(sample.external);
        self.array_buffers = self.array_buffers.max(sample.array_buffers);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAlertKind {
    Warning,
    Critical,
    /// Still over the hard limit after the grace window.
    LimitExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryAlert {
    pub kind: MemoryAlertKind,
    pub rss_mb: f64,
    pub threshold_mb: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub sample_count: usize,
    pub peak: MemoryPeak,
    pub average_rss_mb: f64,
    pub average_heap_used_mb: f64,
    pub trend: MemoryTrend,
    pub growth_rate_mb_per_min: f64,
}

/// Classifies a reading against the soft and hard thresholds.
pub fn evaluate_threshold(rss_mb: f64, warning_mb: f64, max_mb: f64) -> Option<MemoryAlertKind> {
    if rss_mb >= max_mb {
        Some(MemoryAlertKind::Critical)
    } else if rss_mb >= warning_mb {
        Some(MemoryAlertKind::Warning)
    } else {
        None
    }
}

/// Compares first-half and second-half means of the window; differences inside
/// the hysteresis band count as stable.
pub fn trend_of(samples: &[f64], hysteresis_pct: f64) -> MemoryTrend {
    if samples.len() < 2 {
        return MemoryTrend::Stable;
    }
    let mid = samples.len() / 2;
    let first: f64 = samples[..mid].iter().sum::<f64>() / mid.max(1) as f64;
    let second: f64 = samples[mid..].iter().sum::<f64>() / (samples.len() - mid) as f64;
    let band = first.abs() * hysteresis_pct;

    if second > first + band {
        MemoryTrend::Increasing
    } else if second < first - band {
        MemoryTrend::Decreasing
    } else {
        MemoryTrend::Stable
    }
}

pub struct ResourceMonitor {
    config: Arc<ConfigManager>,
    events: EventBus,
    supervisor: Arc<Supervisor>,
    history: Mutex<VecDeque<MemorySample>>,
    peak: RwLock<MemoryPeak>,
    enforcing: Arc<std::sync::atomic::AtomicBool>,
}

impl ResourceMonitor {
    pub fn new(
        config: Arc<ConfigManager>,
        events: EventBus,
        supervisor: Arc<Supervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            supervisor,
            history: Mutex::new(VecDeque::new()),
            peak: RwLock::new(MemoryPeak::default()),
            enforcing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Spawns the sampling and reclamation loops.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let monitor = Arc::clone(self);
        let mut sample_shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!("Resource monitor started");
            loop {
                let interval = Duration::from_millis(
                    monitor.config.current().resource_monitor.sample_interval_ms,
                );
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        monitor.sample_once().await;
                    }
                    _ = sample_shutdown.changed() => {
                        if *sample_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Resource monitor stopped");
        });

        let monitor = Arc::clone(self);
        let mut gc_shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                let interval_ms = monitor.config.current().resource_monitor.gc_interval_ms;
                // zero disables scheduled reclamation; re-check for reloads
                let wait = if interval_ms == 0 {
                    GC_RECHECK
                } else {
                    Duration::from_millis(interval_ms)
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if interval_ms > 0 && monitor.supervisor.is_running() {
                            debug!("Requesting worker reclamation");
                            monitor
                                .supervisor
                                .send_fire_and_forget(RequestBody::Gc)
                                .await;
                        }
                    }
                    _ = gc_shutdown.changed() => {
                        if *gc_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Polls the worker for a status report and folds its memory numbers in.
    pub async fn sample_once(&self) {
        if !self.supervisor.is_running() {
            return;
        }
        match self.supervisor.send_request(RequestBody::Status).await {
            Ok(ResponseBody::Status(report)) => {
                self.check(report.memory);
            }
            Ok(other) => debug!(kind = other.kind(), "Unexpected status reply"),
            Err(err) => debug!("Status sample failed: {}", err),
        }
    }

    /// Records a reading and runs threshold evaluation. Called from the
    /// sampling loop and from heartbeat replies.
    pub fn check(&self, reading: MemoryReading) {
        let sample = self.record_sample(reading);
        let cfg = self.config.current().resource_monitor;

        match evaluate_threshold(sample.rss_mb(), cfg.warning_memory_mb, cfg.max_memory_mb) {
            None => {}
            Some(MemoryAlertKind::Warning) => {
                self.raise(MemoryAlertKind::Warning, sample.rss_mb(), cfg.warning_memory_mb);
            }
            Some(MemoryAlertKind::Critical) => {
                self.raise(MemoryAlertKind::Critical, sample.rss_mb(), cfg.max_memory_mb);
                if cfg.auto_restart {
                    self.spawn_enforcement();
                }
            }
            Some(MemoryAlertKind::LimitExceeded) => unreachable!("not produced by evaluation"),
        }
    }

    /// Records one sample into the bounded history and updates peaks/gauges.
    pub fn record_sample(&self, reading: MemoryReading) -> MemorySample {
        let sample = MemorySample::from_reading(reading);

        metrics::gauge!("metervisor_worker_rss_mb").set(sample.rss_mb());
        metrics::gauge!("metervisor_worker_heap_used_mb").set(sample.heap_used_mb());

        self.peak.write().absorb(&sample);

        let cap = self.config.current().resource_monitor.max_history;
        let mut history = self.history.lock();
        history.push_back(sample);
        while history.len() > cap {
            history.pop_front();
        }

        sample
    }

    fn raise(&self, kind: MemoryAlertKind, rss_mb: f64, threshold_mb: f64) {
        let message = match kind {
            MemoryAlertKind::Warning => format!(
                "worker memory {:.1} MB above warning threshold {:.1} MB",
                rss_mb, threshold_mb
            ),
            MemoryAlertKind::Critical => format!(
                "worker memory {:.1} MB above hard limit {:.1} MB",
                rss_mb, threshold_mb
            ),
            MemoryAlertKind::LimitExceeded => format!(
                "worker memory {:.1} MB still above hard limit {:.1} MB after grace",
                rss_mb, threshold_mb
            ),
        };
        warn!("{}", message);

        self.events.emit(SupervisorEvent::MemoryAlert(MemoryAlert {
            kind,
            rss_mb,
            threshold_mb,
            message,
            raised_at: Utc::now(),
        }));
    }

    fn spawn_enforcement(&self) {
        use std::sync::atomic::Ordering;

        // one grace window at a time
        if self
            .enforcing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let config = Arc::clone(&self.config);
        let events = self.events.clone();
        let supervisor = Arc::clone(&self.supervisor);
        let enforcing = Arc::clone(&self.enforcing);
        tokio::spawn(async move {
            let _release = ClearOnDrop(enforcing);
            let cfg = config.current().resource_monitor;
            let grace = Duration::from_millis(cfg.limit_grace_ms);
            info!(?grace, "Memory over limit, granting grace window");
            tokio::time::sleep(grace).await;

            let rss_mb = match supervisor.send_request(RequestBody::Status).await {
                Ok(ResponseBody::Status(report)) => report.memory.rss_mb(),
                _ => {
                    debug!("Could not re-sample after grace window");
                    return;
                }
            };

            if rss_mb >= cfg.max_memory_mb {
                warn!(rss_mb, limit = cfg.max_memory_mb, "Grace expired, restarting worker");
                events.emit(SupervisorEvent::MemoryAlert(MemoryAlert {
                    kind: MemoryAlertKind::LimitExceeded,
                    rss_mb,
                    threshold_mb: cfg.max_memory_mb,
                    message: format!(
                        "worker memory {:.1} MB still above hard limit {:.1} MB after grace",
                        rss_mb, cfg.max_memory_mb
                    ),
                    raised_at: Utc::now(),
                }));
                events.emit(SupervisorEvent::RestartRequested {
                    reason: RestartReason::MemoryLimit,
                });
            } else {
                info!(rss_mb, "Worker recovered below the limit");
            }
        });
    }

    pub fn stats(&self) -> MemoryStats {
        let cfg = self.config.current().resource_monitor;
        let history = self.history.lock();

        let sample_count = history.len();
        let (sum_rss, sum_heap) = history
            .iter()
            .fold((0.0, 0.0), |(r, h), s| (r + s.rss_mb(), h + s.heap_used_mb()));
        let divisor = sample_count.max(1) as f64;

        let window: Vec<f64> = history
            .iter()
            .rev()
            .take(cfg.trend_window)
            .rev()
            .map(|s| s.rss_mb())
            .collect();

        MemoryStats {
            sample_count,
            peak: *self.peak.read(),
            average_rss_mb: sum_rss / divisor,
            average_heap_used_mb: sum_heap / divisor,
            trend: trend_of(&window, cfg.trend_hysteresis_pct),
            growth_rate_mb_per_min: growth_rate(
                &history.iter().rev().take(cfg.trend_window).rev().cloned().collect::<Vec<_>>(),
            ),
        }
    }

    pub fn latest(&self) -> Option<MemorySample> {
        self.history.lock().back().copied()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
        *self.peak.write() = MemoryPeak::default();
    }
}

struct ClearOnDrop(Arc<std::sync::atomic::AtomicBool>);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Least-squares slope of RSS over time, in MB per minute.
fn growth_rate(samples: &[MemorySample]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let t0 = samples[0].sampled_at;
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| {
            let minutes = (s.sampled_at - t0).num_milliseconds() as f64 / 60_000.0;
            (minutes, s.rss_mb())
        })
        .collect();

    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}
