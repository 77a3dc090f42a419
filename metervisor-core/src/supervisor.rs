//! Worker lifecycle and the correlated duplex message channel.
//!
//! The supervisor owns the worker task and a pending-request table keyed by
//! request id. Every request is settled exactly once: by its response, by its
//! timeout, or by worker shutdown. Lifecycle transitions are serialized so
//! overlapping start/stop/restart calls cannot interleave.

use crate::config::ConfigManager;
use crate::event::{EventBus, SupervisorEvent};
use crate::message::{RequestBody, ResponseBody, WorkerRequest, WorkerResponse};
use crate::worker::MeterReader;
use crate::{Result, SupervisorError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Externally visible lifecycle state of the worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub error_count: u32,
}

struct PendingRequest {
    kind: &'static str,
    reply: oneshot::Sender<Result<ResponseBody>>,
}

struct WorkerHandle {
    request_tx: mpsc::Sender<WorkerRequest>,
    worker: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

type PendingMap = Arc<SyncMutex<HashMap<Uuid, PendingRequest>>>;

pub struct Supervisor {
    config: Arc<ConfigManager>,
    events: EventBus,
    reader: Arc<dyn MeterReader>,
    handle: Mutex<Option<WorkerHandle>>,
    lifecycle: Mutex<()>,
    pending: PendingMap,
    status: Arc<RwLock<WorkerStatus>>,
    stopping: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigManager>, events: EventBus, reader: Arc<dyn MeterReader>) -> Self {
        Self {
            config,
            events,
            reader,
            handle: Mutex::new(None),
            lifecycle: Mutex::new(()),
            pending: Arc::new(SyncMutex::new(HashMap::new())),
            status: Arc::new(RwLock::new(WorkerStatus::default())),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the worker. A live worker is stopped first, so start is also
    /// "replace".
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.handle.lock().await.is_some() {
            self.stop_inner().await;
        }
        self.start_inner().await
    }

    /// Stops the worker gracefully, aborting it after the configured grace
    /// period. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_inner().await;
    }

    /// Stop followed by start under one lifecycle guard. Increments the
    /// restart counter only when the new worker actually comes up.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_inner().await;
        self.start_inner().await?;
        self.status.write().restart_count += 1;
        Ok(())
    }

    async fn start_inner(&self) -> Result<()> {
        let cfg = self.config.current().thread_manager;
        if cfg.channel_capacity == 0 {
            let message = "worker spawn failed: channel capacity is zero".to_string();
            self.events.emit(SupervisorEvent::WorkerError {
                message: message.clone(),
            });
            return Err(SupervisorError::SpawnFailed(message));
        }

        let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>(cfg.channel_capacity);
        let (response_tx, response_rx) = mpsc::channel::<WorkerResponse>(cfg.channel_capacity);

        self.stopping.store(false, Ordering::SeqCst);

        let worker = tokio::spawn(crate::worker::run(
            request_rx,
            response_tx,
            Arc::clone(&self.reader),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            response_rx,
            Arc::clone(&self.pending),
            Arc::clone(&self.status),
            Arc::clone(&self.stopping),
            self.events.clone(),
        ));

        *self.handle.lock().await = Some(WorkerHandle {
            request_tx,
            worker,
            dispatch,
        });

        {
            let mut status = self.status.write();
            status.is_running = true;
            status.start_time = Some(Utc::now());
            status.last_health_check = None;
        }

        info!("Worker started");
        self.events.emit(SupervisorEvent::WorkerStarted);
        metrics::gauge!("metervisor_worker_running").set(1.0);
        Ok(())
    }

    async fn stop_inner(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };

        self.stopping.store(true, Ordering::SeqCst);
        let grace = Duration::from_millis(self.config.current().thread_manager.shutdown_grace_ms);

        // polite stop first; the worker acknowledges with Stopping and exits
        let stop = WorkerRequest {
            request_id: Uuid::new_v4(),
            body: RequestBody::Stop,
        };
        if handle.request_tx.send(stop).await.is_err() {
            debug!("Worker request channel already closed during stop");
        }
        drop(handle.request_tx);

        let abort = handle.worker.abort_handle();
        match tokio::time::timeout(grace, handle.worker).await {
            Ok(_) => info!("Worker exited within grace period"),
            Err(_) => {
                warn!("Worker did not exit within {:?}, aborting", grace);
                abort.abort();
            }
        }
        handle.dispatch.abort();

        self.reject_pending(|| SupervisorError::Stopped);

        {
            let mut status = self.status.write();
            status.is_running = false;
            status.start_time = None;
            status.last_health_check = None;
        }

        info!("Worker stopped");
        self.events.emit(SupervisorEvent::WorkerStopped);
        metrics::gauge!("metervisor_worker_running").set(0.0);
    }

    /// Sends a request and waits for its correlated response, failing after
    /// the configured message timeout.
    pub async fn send_request(&self, body: RequestBody) -> Result<ResponseBody> {
        let timeout = Duration::from_millis(self.config.current().thread_manager.message_timeout_ms);
        self.send_request_timeout(body, timeout).await
    }

    /// Same as [`Supervisor::send_request`] with an explicit deadline.
    pub async fn send_request_timeout(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody> {
        let request_tx = {
            let handle = self.handle.lock().await;
            let Some(handle) = handle.as_ref() else {
                return Err(SupervisorError::WorkerNotRunning);
            };
            handle.request_tx.clone()
        };

        let request_id = Uuid::new_v4();
        let kind = body.kind();
        let (reply_tx, mut reply_rx) = oneshot::channel();

        self.pending.lock().insert(
            request_id,
            PendingRequest {
                kind,
                reply: reply_tx,
            },
        );

        let request = WorkerRequest { request_id, body };
        if request_tx.send(request).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(SupervisorError::ChannelClosed);
        }

        // The receiver is polled by reference so a response racing the
        // deadline can still be picked up after the sleep completes.
        tokio::select! {
            result = &mut reply_rx => {
                result.unwrap_or(Err(SupervisorError::ChannelClosed))
            }
            _ = tokio::time::sleep(timeout) => {
                if self.pending.lock().remove(&request_id).is_some() {
                    debug!(kind, %request_id, "Request timed out");
                    Err(SupervisorError::RequestTimeout { kind, timeout })
                } else {
                    // the dispatcher settled it between the deadline firing
                    // and the table lock; take the response
                    match reply_rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(SupervisorError::ChannelClosed),
                    }
                }
            }
        }
    }

    /// Sends a request without registering a pending entry. Failures are
    /// reported on the event bus, not to the caller; any eventual response
    /// surfaces as an unsolicited-message event.
    pub async fn send_fire_and_forget(&self, body: RequestBody) {
        let kind = body.kind();
        let request_tx = {
            let handle = self.handle.lock().await;
            let Some(handle) = handle.as_ref() else {
                self.events.emit(SupervisorEvent::WorkerError {
                    message: format!("{} request dropped: worker is not running", kind),
                });
                return;
            };
            handle.request_tx.clone()
        };

        let request = WorkerRequest {
            request_id: Uuid::new_v4(),
            body,
        };
        if request_tx.send(request).await.is_err() {
            self.events.emit(SupervisorEvent::WorkerError {
                message: format!("{} request dropped: worker channel closed", kind),
            });
        }
    }

    fn reject_pending(&self, error: impl Fn() -> SupervisorError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            debug!(kind = entry.kind, "Rejecting pending request");
            let _ = entry.reply.send(Err(error()));
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.read().is_running
    }

    pub fn uptime(&self) -> Option<Duration> {
        let status = self.status.read();
        status
            .start_time
            .map(|start| (Utc::now() - start).to_std().unwrap_or_default())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn note_health_check(&self) {
        self.status.write().last_health_check = Some(Utc::now());
    }

    pub fn note_error(&self) {
        self.status.write().error_count += 1;
    }
}

/// Routes worker responses to their pending requests. Responses with no
/// matching entry (late arrivals, double replies) are surfaced as events and
/// otherwise ignored.
async fn dispatch_loop(
    mut response_rx: mpsc::Receiver<WorkerResponse>,
    pending: PendingMap,
    status: Arc<RwLock<WorkerStatus>>,
    stopping: Arc<AtomicBool>,
    events: EventBus,
) {
    while let Some(response) = response_rx.recv().await {
        let entry = pending.lock().remove(&response.request_id);
        match entry {
            Some(entry) => {
                let result = match response.body {
                    ResponseBody::Error { message } => Err(SupervisorError::Worker(message)),
                    body => Ok(body),
                };
                if entry.reply.send(result).is_err() {
                    debug!(kind = entry.kind, "Requester gave up before the reply");
                }
            }
            None => {
                if matches!(response.body, ResponseBody::Stopping) {
                    debug!("Worker acknowledged stop");
                } else {
                    debug!(
                        kind = response.body.kind(),
                        %response.request_id,
                        "Unmatched worker response"
                    );
                    events.emit(SupervisorEvent::UnsolicitedMessage(response));
                }
            }
        }
    }

    // channel closed: either a graceful stop or the worker died
    if !stopping.load(Ordering::SeqCst) {
        warn!("Worker response channel closed unexpectedly");
        let drained: Vec<PendingRequest> = {
            let mut table = pending.lock();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.reply.send(Err(SupervisorError::ChannelClosed));
        }
        status.write().is_running = false;
        metrics::gauge!("metervisor_worker_running").set(0.0);
        events.emit(SupervisorEvent::WorkerExited {
            reason: "response channel closed".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::SimulatedMeterReader;

    fn supervisor() -> Supervisor {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        Supervisor::new(config, events, Arc::new(SimulatedMeterReader::default()))
    }

    #[tokio::test]
    async fn test_request_before_start_fails() {
        let supervisor = supervisor();
        let result = supervisor.send_request(RequestBody::Ping).await;
        assert!(matches!(result, Err(SupervisorError::WorkerNotRunning)));
    }

    #[tokio::test]
    async fn test_fire_and_forget_failure_surfaces_as_event() {
        let events = EventBus::default();
        let config = Arc::new(ConfigManager::new(events.clone()));
        let supervisor = Supervisor::new(
            config,
            events.clone(),
            Arc::new(SimulatedMeterReader::default()),
        );
        let mut rx = events.subscribe();

        // worker never started, so the send has nowhere to go
        supervisor.send_fire_and_forget(RequestBody::Gc).await;

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SupervisorEvent::WorkerError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let supervisor = supervisor();
        supervisor.start().await.unwrap();

        let response = supervisor.send_request(RequestBody::Ping).await.unwrap();
        assert!(matches!(response, ResponseBody::Pong(_)));
        assert_eq!(supervisor.pending_count(), 0);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor = supervisor();
        supervisor.start().await.unwrap();
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_restart_increments_counter() {
        let supervisor = supervisor();
        supervisor.start().await.unwrap();
        supervisor.restart().await.unwrap();
        supervisor.restart().await.unwrap();

        let status = supervisor.status();
        assert!(status.is_running);
        assert_eq!(status.restart_count, 2);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_start_replaces_live_worker() {
        let supervisor = supervisor();
        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        // replace is not a restart
        assert_eq!(supervisor.status().restart_count, 0);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_worker_error_response_maps_to_err() {
        let supervisor = supervisor();
        supervisor.start().await.unwrap();

        let device = crate::message::DeviceDescriptor {
            name: String::new(),
            host: "10.0.0.9".to_string(),
            port: 502,
            unit_id: 1,
            registers: Default::default(),
        };
        let result = supervisor
            .send_request(RequestBody::CollectMeterData(device))
            .await;
        assert!(matches!(result, Err(SupervisorError::Worker(_))));

        supervisor.stop().await;
    }
}
