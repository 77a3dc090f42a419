//! Top-level assembly: wires the supervisor, monitors, error handling, and
//! the periodic polling loop into one operator-facing surface.

use crate::config::{ConfigManager, ConfigSource, ConfigUpdate, UpdateOutcome};
use crate::error_handler::{ErrorContext, ErrorHandler, ErrorStats};
use crate::event::{EventBus, RestartReason, SupervisorEvent};
use crate::health::{HealthMonitor, HealthReport};
use crate::message::{MeterReading, RequestBody, ResponseBody};
use crate::resource::{MemoryStats, ResourceMonitor};
use crate::restart::RestartManager;
use crate::supervisor::Supervisor;
use crate::worker::MeterReader;
use crate::{ConfigError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Destination for collected readings.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn store(&self, reading: &MeterReading) -> anyhow::Result<()>;
}

/// Sink that just logs each reading. Useful for development and as the
/// fallback when persistence is disabled.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ReadingSink for LogSink {
    async fn store(&self, reading: &MeterReading) -> anyhow::Result<()> {
        info!(
            device = %reading.device,
            voltage = reading.voltage,
            power_w = reading.power_w,
            energy_kwh = reading.energy_kwh,
            "Meter reading"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub error_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub errors: ErrorStats,
    pub memory: MemoryStats,
}

pub struct MeterSupervisorRuntime {
    config: Arc<ConfigManager>,
    events: EventBus,
    supervisor: Arc<Supervisor>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceMonitor>,
    errors: Arc<ErrorHandler>,
    restarts: Arc<RestartManager>,
    sink: Arc<dyn ReadingSink>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MeterSupervisorRuntime {
    pub fn new(
        config: Arc<ConfigManager>,
        events: EventBus,
        reader: Arc<dyn MeterReader>,
        sink: Arc<dyn ReadingSink>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&config),
            events.clone(),
            reader,
        ));
        let resources = ResourceMonitor::new(
            Arc::clone(&config),
            events.clone(),
            Arc::clone(&supervisor),
        );
        let health = HealthMonitor::new(
            Arc::clone(&config),
            events.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&resources),
        );
        let errors = Arc::new(ErrorHandler::new(Arc::clone(&config), events.clone()));
        let restarts = Arc::new(RestartManager::new(Arc::clone(&config)));
        let (shutdown_tx, shutdown_rx) = crate::ops::shutdown_signal();

        Arc::new(Self {
            config,
            events,
            supervisor,
            health,
            resources,
            errors,
            restarts,
            sink,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Starts the worker and all supervision loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("Starting meter supervisor runtime");
        self.supervisor.start().await?;
        self.health.start(self.shutdown_rx.clone());
        self.resources.start(self.shutdown_rx.clone());

        // subscribe before returning so no event emitted right after start
        // can slip past the loop
        let bus = self.events.subscribe();
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            runtime.run_event_loop(bus).await;
        });

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            runtime.run_poll_loop().await;
        });

        Ok(())
    }

    /// Stops everything: loops first, then the worker.
    pub async fn stop(&self) {
        info!("Stopping meter supervisor runtime");
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop().await;
    }

    /// Reacts to supervision events: faults feed the error handler, restart
    /// requests go through the restart manager.
    async fn run_event_loop(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<SupervisorEvent>,
    ) {
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SupervisorEvent::WorkerError { message }) => {
                        self.supervisor.note_error();
                        self.errors.handle_error(message, ErrorContext::worker());
                    }
                    Ok(SupervisorEvent::WorkerExited { reason }) => {
                        self.supervisor.note_error();
                        self.errors.handle_error(
                            format!("worker exited unexpectedly: {}", reason),
                            ErrorContext::worker(),
                        );
                    }
                    Ok(SupervisorEvent::WorkerUnhealthy { consecutive }) => {
                        self.supervisor.note_error();
                        self.errors.handle_error(
                            format!("worker unresponsive after {} missed health checks", consecutive),
                            ErrorContext::worker(),
                        );
                    }
                    Ok(SupervisorEvent::RestartRequested { reason }) => {
                        let runtime = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = runtime
                                .restarts
                                .execute(&runtime.supervisor, reason)
                                .await
                            {
                                warn!("Restart attempt failed: {}", err);
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event loop lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Event loop exited");
    }

    /// Collects readings from every configured device each poll interval.
    async fn run_poll_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            let cfg = self.config.current().worker;
            let interval = Duration::from_millis(cfg.poll_interval_ms);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !self.supervisor.is_running() {
                        continue;
                    }
                    for device in &cfg.devices {
                        self.collect_one(device.clone()).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Poll loop exited");
    }

    async fn collect_one(&self, device: crate::message::DeviceDescriptor) {
        let name = device.name.clone();
        match self
            .supervisor
            .send_request(RequestBody::CollectMeterData(device))
            .await
        {
            Ok(ResponseBody::MeterData(reading)) => {
                metrics::gauge!("metervisor_meter_power_w", "device" => name.clone())
                    .set(reading.power_w);
                metrics::counter!("metervisor_reads_total", "device" => name).increment(1);

                if let Err(err) = self.sink.store(&reading).await {
                    self.errors.handle_error(
                        format!("persistence sink rejected reading: {:#}", err),
                        ErrorContext::external("persistence-sink")
                            .with_operation("store_reading"),
                    );
                }
            }
            Ok(other) => {
                self.errors.handle_error(
                    format!(
                        "unexpected {} reply to a meter data request for {}",
                        other.kind(),
                        name
                    ),
                    ErrorContext::communication().with_operation("collect_meter_data"),
                );
            }
            Err(err) => {
                self.errors.handle_error(
                    format!("meter data request for {} failed: {}", name, err),
                    ErrorContext::communication().with_operation("collect_meter_data"),
                );
            }
        }
    }

    // ---- operator surface ----

    pub fn status(&self) -> StatusReport {
        let status = self.supervisor.status();
        StatusReport {
            running: status.is_running,
            uptime_secs: self.supervisor.uptime().map(|d| d.as_secs()),
            restart_count: status.restart_count,
            error_count: status.error_count,
            last_health_check: status.last_health_check,
        }
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            errors: self.errors.stats(),
            memory: self.resources.stats(),
        }
    }

    /// Sends a raw request to the worker and returns the correlated reply.
    pub async fn send(&self, body: RequestBody) -> Result<ResponseBody> {
        self.supervisor.send_request(body).await
    }

    pub fn update_config(
        &self,
        update: ConfigUpdate,
        source: ConfigSource,
    ) -> std::result::Result<UpdateOutcome, ConfigError> {
        self.config.update(update, source)
    }

    /// Operator-initiated restart, routed through the restart manager so the
    /// same backoff and breaker rules apply.
    pub async fn restart_worker(&self) -> Result<()> {
        self.restarts
            .execute(&self.supervisor, RestartReason::Manual)
            .await
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn restarts(&self) -> &Arc<RestartManager> {
        &self.restarts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::SimulatedMeterReader;

    fn runtime() -> Arc<MeterSupervisorRuntime> {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        MeterSupervisorRuntime::new(
            config,
            events,
            Arc::new(SimulatedMeterReader::default()),
            Arc::new(LogSink),
        )
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let runtime = runtime();
        runtime.start().await.unwrap();
        assert!(runtime.status().running);

        runtime.stop().await;
        assert!(!runtime.status().running);
    }

    #[tokio::test]
    async fn test_send_reaches_worker() {
        let runtime = runtime();
        runtime.start().await.unwrap();

        let reply = runtime.send(RequestBody::Ping).await.unwrap();
        assert!(matches!(reply, ResponseBody::Pong(_)));

        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_manual_restart_goes_through_manager() {
        let runtime = runtime();
        runtime.start().await.unwrap();

        runtime.restart_worker().await.unwrap();
        assert_eq!(runtime.status().restart_count, 1);
        assert!(runtime.status().running);

        runtime.stop().await;
    }
}
