//! Restart orchestration: exponential backoff, attempt budget, circuit breaker.

use crate::config::ConfigManager;
use crate::event::RestartReason;
use crate::supervisor::Supervisor;
use crate::{Result, SupervisorError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Exponential restart backoff. Attempt 0 restarts immediately; attempt `n`
/// waits `base * 2^(n-1)` capped at the maximum.
#[derive(Debug, Clone, Copy)]
pub struct RestartBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(32);
        let factor = 2u64.saturating_pow(shift);
        let delay = self.base_delay.saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerInner {
    Closed { failures: usize },
    Open { opened_at: Instant },
    HalfOpen { successes: usize },
}

/// Circuit breaker guarding repeated restart failures. After the failure
/// threshold the breaker opens; once the open window elapses a single probe
/// call is allowed through.
pub struct CircuitBreaker {
    state: Mutex<BreakerInner>,
    failure_threshold: usize,
    open_duration: Duration,
    half_open_successes: usize,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: usize,
        open_duration: Duration,
        half_open_successes: usize,
    ) -> Self {
        Self {
            state: Mutex::new(BreakerInner::Closed { failures: 0 }),
            failure_threshold,
            open_duration,
            half_open_successes: half_open_successes.max(1),
        }
    }

    /// Runs the operation through the breaker; rejected without running it
    /// while the breaker is open.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        {
            let mut state = self.state.lock().await;
            match &*state {
                BreakerInner::Open { opened_at } => {
                    if opened_at.elapsed() >= self.open_duration {
                        info!("Circuit breaker half-open, probing");
                        *state = BreakerInner::HalfOpen { successes: 0 };
                    } else {
                        return Err(SupervisorError::SpawnFailed(
                            "restart circuit breaker is open".to_string(),
                        ));
                    }
                }
                BreakerInner::Closed { .. } | BreakerInner::HalfOpen { .. } => {}
            }
        }

        match op().await {
            Ok(value) => {
                let mut state = self.state.lock().await;
                match &mut *state {
                    BreakerInner::Closed { failures } => *failures = 0,
                    BreakerInner::HalfOpen { successes } => {
                        *successes += 1;
                        if *successes >= self.half_open_successes {
                            info!("Circuit breaker closed");
                            *state = BreakerInner::Closed { failures: 0 };
                        }
                    }
                    BreakerInner::Open { .. } => {}
                }
                Ok(value)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                match &mut *state {
                    BreakerInner::Closed { failures } => {
                        *failures += 1;
                        if *failures >= self.failure_threshold {
                            warn!(failures = *failures, "Circuit breaker opened");
                            *state = BreakerInner::Open {
                                opened_at: Instant::now(),
                            };
                        }
                    }
                    BreakerInner::HalfOpen { .. } => {
                        warn!("Probe failed, circuit breaker re-opened");
                        *state = BreakerInner::Open {
                            opened_at: Instant::now(),
                        };
                    }
                    BreakerInner::Open { .. } => {}
                }
                Err(err)
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        match &*self.state.lock().await {
            BreakerInner::Closed { .. } => CircuitState::Closed,
            BreakerInner::Open { opened_at } => {
                if opened_at.elapsed() >= self.open_duration {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            BreakerInner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == CircuitState::Open
    }

    pub async fn reset(&self) {
        *self.state.lock().await = BreakerInner::Closed { failures: 0 };
    }
}

/// Serializes restarts and enforces the attempt budget. Concurrent restart
/// requests coalesce behind one mutex; a successful restart resets the
/// consecutive-failure counter.
pub struct RestartManager {
    config: Arc<ConfigManager>,
    breaker: CircuitBreaker,
    consecutive_failures: AtomicU32,
    restarting: Mutex<()>,
}

impl RestartManager {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        let cfg = config.current().restart_manager;
        let breaker = CircuitBreaker::new(
            cfg.breaker_failure_threshold,
            Duration::from_millis(cfg.breaker_open_ms),
            cfg.breaker_half_open_successes,
        );
        Self {
            config,
            breaker,
            consecutive_failures: AtomicU32::new(0),
            restarting: Mutex::new(()),
        }
    }

    /// Executes one restart cycle: budget check, backoff wait, guarded restart.
    pub async fn execute(&self, supervisor: &Supervisor, reason: RestartReason) -> Result<()> {
        let _guard = self.restarting.lock().await;

        let cfg = self.config.current().restart_manager;
        let attempt = self.consecutive_failures.load(Ordering::SeqCst);

        if attempt >= cfg.max_restart_attempts {
            warn!(
                attempt,
                max = cfg.max_restart_attempts,
                "Restart budget exhausted, refusing restart"
            );
            return Err(SupervisorError::SpawnFailed(format!(
                "restart budget exhausted after {} attempts",
                attempt
            )));
        }

        let backoff = RestartBackoff::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        );
        let delay = backoff.delay_for(attempt);
        if !delay.is_zero() {
            info!(attempt, ?delay, ?reason, "Backing off before restart");
            tokio::time::sleep(delay).await;
        }

        info!(attempt, ?reason, "Restarting worker");
        metrics::counter!("metervisor_restarts_total").increment(1);

        let result = self.breaker.call(|| supervisor.restart()).await;

        match &result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                info!("Worker restart succeeded");
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(failures, "Worker restart failed: {}", err);
            }
        }

        result
    }

    /// Clears the failure counter and the breaker, typically after a manual
    /// intervention.
    pub async fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.breaker.reset().await;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn breaker_state(&self) -> CircuitState {
        self.breaker.state().await
    }
}
