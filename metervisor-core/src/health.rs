//! Heartbeat health checks over the request channel.
//!
//! A check is a `Ping` with its own (shorter) timeout. Misses accumulate; at
//! the configured threshold the worker is declared unhealthy exactly once, and
//! a single successful pong restores it.

use crate::config::ConfigManager;
use crate::event::{EventBus, SupervisorEvent};
use crate::message::{RequestBody, ResponseBody};
use crate::resource::ResourceMonitor;
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Monitor not running or worker not started.
    Idle,
    /// Checks running, no verdict yet.
    Monitoring,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub consecutive_misses: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_uptime_secs: Option<u64>,
}

// first tick after one full period, not immediately
fn make_ticker(interval_ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(interval_ms.max(1));
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

pub struct HealthMonitor {
    config: Arc<ConfigManager>,
    events: EventBus,
    supervisor: Arc<Supervisor>,
    resources: Arc<ResourceMonitor>,
    state: RwLock<HealthState>,
    consecutive_misses: AtomicU32,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_uptime_secs: RwLock<Option<u64>>,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<ConfigManager>,
        events: EventBus,
        supervisor: Arc<Supervisor>,
        resources: Arc<ResourceMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            supervisor,
            resources,
            state: RwLock::new(HealthState::Idle),
            consecutive_misses: AtomicU32::new(0),
            last_success: RwLock::new(None),
            last_uptime_secs: RwLock::new(None),
        })
    }

    /// Spawns the periodic check loop; it runs until the shutdown signal
    /// flips. The interval is re-read every tick so config reloads apply
    /// without a restart.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let monitor = Arc::clone(self);
        *monitor.state.write() = HealthState::Monitoring;
        let mut events = monitor.events.subscribe();

        tokio::spawn(async move {
            info!("Health monitor started");
            let mut interval_ms = monitor.config.current().health_monitor.check_interval_ms;
            let mut ticker = make_ticker(interval_ms);
            loop {
                // the ticker survives event handling, so bus traffic cannot
                // push the next check out; rebuilt only on a config change
                let configured = monitor.config.current().health_monitor.check_interval_ms;
                if configured != interval_ms {
                    interval_ms = configured;
                    ticker = make_ticker(interval_ms);
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_now().await;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(SupervisorEvent::WorkerStarted)
                            | Ok(SupervisorEvent::WorkerStopped)
                            | Ok(SupervisorEvent::WorkerExited { .. }) => {
                                monitor.reset();
                            }
                            Ok(_) => {}
                            Err(_) => {}
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            *monitor.state.write() = HealthState::Idle;
            info!("Health monitor stopped");
        });
    }

    /// Runs one health check immediately.
    pub async fn check_now(&self) {
        if !self.supervisor.is_running() {
            debug!("Health check skipped, worker not running");
            self.record_miss();
            return;
        }

        let timeout =
            Duration::from_millis(self.config.current().health_monitor.check_timeout_ms);
        match self
            .supervisor
            .send_request_timeout(RequestBody::Ping, timeout)
            .await
        {
            Ok(ResponseBody::Pong(report)) => {
                self.consecutive_misses.store(0, Ordering::SeqCst);
                *self.last_success.write() = Some(Utc::now());
                *self.last_uptime_secs.write() = Some(report.uptime_secs);
                self.supervisor.note_health_check();

                if let Some(memory) = report.memory {
                    self.resources.check(memory);
                }

                let was_degraded = {
                    let mut state = self.state.write();
                    let was = *state == HealthState::Degraded;
                    *state = HealthState::Healthy;
                    was
                };
                if was_degraded {
                    info!("Worker recovered, healthy again");
                    self.events.emit(SupervisorEvent::WorkerHealthy);
                }
            }
            Ok(other) => {
                warn!(kind = other.kind(), "Unexpected health check reply");
                self.record_miss();
            }
            Err(err) => {
                debug!("Health check failed: {}", err);
                self.record_miss();
            }
        }
    }

    fn record_miss(&self) {
        let consecutive = self.consecutive_misses.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.config.current().health_monitor.max_missed_checks;

        warn!(consecutive, threshold, "Health check missed");
        self.events
            .emit(SupervisorEvent::HealthCheckMissed { consecutive });
        metrics::counter!("metervisor_health_misses_total").increment(1);

        if consecutive >= threshold {
            let newly_degraded = {
                let mut state = self.state.write();
                let was = *state;
                *state = HealthState::Degraded;
                was != HealthState::Degraded
            };
            if newly_degraded {
                warn!(consecutive, "Worker declared unhealthy");
                self.events
                    .emit(SupervisorEvent::WorkerUnhealthy { consecutive });
            }
        }
    }

    fn reset(&self) {
        self.consecutive_misses.store(0, Ordering::SeqCst);
        let mut state = self.state.write();
        if *state != HealthState::Idle {
            *state = HealthState::Monitoring;
        }
    }

    pub fn is_worker_healthy(&self) -> bool {
        let threshold = self.config.current().health_monitor.max_missed_checks;
        self.consecutive_misses.load(Ordering::SeqCst) < threshold
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            state: *self.state.read(),
            consecutive_misses: self.consecutive_misses.load(Ordering::SeqCst),
            last_success: *self.last_success.read(),
            last_uptime_secs: *self.last_uptime_secs.read(),
        }
    }
}
