//! The isolated polling worker: serves supervisor requests until told to stop.

use crate::message::{
    HeartbeatReport, MemoryReading, MeterReading, RequestBody, ResponseBody, WorkerRequest,
    WorkerResponse, WorkerStatusReport,
};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reads one measurement set from a field-bus meter.
#[async_trait]
pub trait MeterReader: Send + Sync {
    async fn read(&self, device: &crate::message::DeviceDescriptor)
        -> anyhow::Result<MeterReading>;
}

/// Deterministic reader for development and tests: plausible values with a
/// slow time-based wobble, no bus access.
#[derive(Debug, Clone)]
pub struct SimulatedMeterReader {
    pub nominal_voltage: f64,
    pub nominal_current: f64,
}

impl Default for SimulatedMeterReader {
    fn default() -> Self {
        Self {
            nominal_voltage: 230.0,
            nominal_current: 8.0,
        }
    }
}

#[async_trait]
impl MeterReader for SimulatedMeterReader {
    async fn read(
        &self,
        device: &crate::message::DeviceDescriptor,
    ) -> anyhow::Result<MeterReading> {
        if device.name.trim().is_empty() {
            anyhow::bail!("device name is empty");
        }

        let phase = Utc::now().timestamp_millis() as f64 / 10_000.0;
        let voltage = self.nominal_voltage + phase.sin() * 2.5;
        let current = (self.nominal_current + phase.cos() * 1.5).max(0.0);
        let power_factor = 0.95 + phase.sin() * 0.02;
        let power_w = voltage * current * power_factor;

        Ok(MeterReading {
            device: device.name.clone(),
            voltage,
            current,
            power_w,
            energy_kwh: phase.abs() / 100.0,
            frequency_hz: 50.0 + phase.sin() * 0.05,
            power_factor,
            phase_voltages: [voltage, voltage - 0.8, voltage + 0.6],
            phase_currents: [current, current * 0.97, current * 1.02],
            read_at: Utc::now(),
        })
    }
}

/// Worker main loop. Exits when a `Stop` request arrives or the request
/// channel closes.
pub(crate) async fn run(
    mut requests: mpsc::Receiver<WorkerRequest>,
    responses: mpsc::Sender<WorkerResponse>,
    reader: std::sync::Arc<dyn MeterReader>,
) {
    let started = Instant::now();
    let mut system = System::new();
    let pid = Pid::from_u32(std::process::id());

    let mut requests_served: u64 = 0;
    let mut reads_completed: u64 = 0;
    let mut reads_failed: u64 = 0;

    info!("Worker loop entered");

    while let Some(request) = requests.recv().await {
        requests_served += 1;
        let request_id = request.request_id;

        let body = match request.body {
            RequestBody::Ping => ResponseBody::Pong(HeartbeatReport {
                memory: Some(sample_memory(&mut system, pid)),
                uptime_secs: started.elapsed().as_secs(),
            }),
            RequestBody::Status => ResponseBody::Status(WorkerStatusReport {
                memory: sample_memory(&mut system, pid),
                uptime_secs: started.elapsed().as_secs(),
                requests_served,
                reads_completed,
                reads_failed,
            }),
            RequestBody::Gc => {
                // no collector to prod on this runtime; the request exists so
                // supervisors can schedule reclamation uniformly
                debug!("Gc request acknowledged");
                ResponseBody::GcDone
            }
            RequestBody::Stop => {
                info!("Stop request received, worker exiting");
                let _ = responses
                    .send(WorkerResponse {
                        request_id,
                        body: ResponseBody::Stopping,
                    })
                    .await;
                break;
            }
            RequestBody::CollectMeterData(device) => match reader.read(&device).await {
                Ok(reading) => {
                    reads_completed += 1;
                    debug!(device = %reading.device, power_w = reading.power_w, "Meter read ok");
                    ResponseBody::MeterData(reading)
                }
                Err(err) => {
                    reads_failed += 1;
                    warn!(device = %device.name, "Meter read failed: {:#}", err);
                    ResponseBody::Error {
                        message: format!("meter read failed for {}: {:#}", device.name, err),
                    }
                }
            },
        };

        if responses
            .send(WorkerResponse { request_id, body })
            .await
            .is_err()
        {
            debug!("Response channel closed, worker exiting");
            break;
        }
    }

    info!(
        requests_served,
        reads_completed, reads_failed, "Worker loop exited"
    );
}

fn sample_memory(system: &mut System, pid: Pid) -> MemoryReading {
    system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
    match system.process(pid) {
        Some(process) => MemoryReading {
            rss: process.memory(),
            heap_used: process.memory(),
            heap_total: process.virtual_memory(),
            external: 0,
            array_buffers: 0,
        },
        None => MemoryReading::default(),
    }
}
