//! Worker message protocol: correlated requests/responses and meter data shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Request sent from the supervisor to the worker over the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Request payloads. The wire tag matches the original protocol names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum RequestBody {
    Ping,
    Status,
    Gc,
    Stop,
    CollectMeterData(DeviceDescriptor),
}

impl RequestBody {
    /// Wire name of the message type, used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestBody::Ping => "ping",
            RequestBody::Status => "status",
            RequestBody::Gc => "gc",
            RequestBody::Stop => "stop",
            RequestBody::CollectMeterData(_) => "collectMeterData",
        }
    }
}

/// Response sent from the worker back to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Response payloads. `Error` carries a human-readable message instead of data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ResponseBody {
    Pong(HeartbeatReport),
    Status(WorkerStatusReport),
    GcDone,
    Stopping,
    MeterData(MeterReading),
    Error { message: String },
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Pong(_) => "pong",
            ResponseBody::Status(_) => "status",
            ResponseBody::GcDone => "gcDone",
            ResponseBody::Stopping => "stopping",
            ResponseBody::MeterData(_) => "meterData",
            ResponseBody::Error { .. } => "error",
        }
    }
}

/// Liveness reply; may embed the worker's latest memory reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub memory: Option<MemoryReading>,
    pub uptime_secs: u64,
}

/// Snapshot of the worker's internal counters and memory usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusReport {
    pub memory: MemoryReading,
    pub uptime_secs: u64,
    pub requests_served: u64,
    pub reads_completed: u64,
    pub reads_failed: u64,
}

/// Point-in-time memory usage reported by the worker, in bytes.
///
/// `rss` and `heap_total` map to the process resident/virtual sizes; the
/// remaining fields have no native equivalent on this runtime and are carried
/// as zero so per-field statistics stay shape-compatible.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReading {
    pub rss: u64,
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub array_buffers: u64,
}

impl MemoryReading {
    pub fn rss_mb(&self) -> f64 {
        self.rss as f64 / BYTES_PER_MB
    }
}

/// Address and register layout of one field-bus meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    #[serde(default)]
    pub registers: RegisterMap,
}

/// Input-register addresses for the measurands, SDM-style defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMap {
    pub voltage: u16,
    pub current: u16,
    pub power: u16,
    pub energy: u16,
    pub frequency: u16,
    pub power_factor: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            voltage: 0x0000,
            current: 0x0006,
            power: 0x000C,
            energy: 0x0156,
            frequency: 0x0046,
            power_factor: 0x001E,
        }
    }
}

/// Flat numeric reading destined for the persistence sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterReading {
    pub device: String,
    pub voltage: f64,
    pub current: f64,
    pub power_w: f64,
    pub energy_kwh: f64,
    pub frequency_hz: f64,
    pub power_factor: f64,
    pub phase_voltages: [f64; 3],
    pub phase_currents: [f64; 3],
    pub read_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_tags() {
        let request = WorkerRequest {
            request_id: Uuid::new_v4(),
            body: RequestBody::CollectMeterData(DeviceDescriptor {
                name: "meter-1".to_string(),
                host: "10.0.0.5".to_string(),
                port: 502,
                unit_id: 1,
                registers: RegisterMap::default(),
            }),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "collectMeterData");
        assert!(value["requestId"].is_string());
        assert_eq!(value["payload"]["host"], "10.0.0.5");
    }

    #[test]
    fn test_ping_has_no_payload() {
        let request = WorkerRequest {
            request_id: Uuid::new_v4(),
            body: RequestBody::Ping,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "ping");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_error_response_round_trip() {
        let response = WorkerResponse {
            request_id: Uuid::new_v4(),
            body: ResponseBody::Error {
                message: "register read failed".to_string(),
            },
        };

        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: WorkerResponse = serde_json::from_str(&encoded).unwrap();
        match decoded.body {
            ResponseBody::Error { message } => assert_eq!(message, "register read failed"),
            other => panic!("unexpected body: {}", other.kind()),
        }
    }

    #[test]
    fn test_memory_reading_mb() {
        let reading = MemoryReading {
            rss: 256 * 1024 * 1024,
            ..MemoryReading::default()
        };
        assert!((reading.rss_mb() - 256.0).abs() < f64::EPSILON);
    }
}
