//! Persisted FIFO of mutating requests made while the server could not be reached.

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::Result;
use crate::events::Subscription;
use crate::runtime::{TimerHandle, TimerRegistry};
use crate::store::{self, KeyValueStore};
use crate::telemetry::RuntimeCounters;
use crate::transport::request::{ApiRequest, ApiResponse, Method};
use crate::transport::{ErrorKind, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

pub const PENDING_OPERATIONS_KEY: &str = "pending_operations";
pub const PENDING_SEQUENCE_KEY: &str = "pending_operations_seq";
pub const MAX_REPLAY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: u64,
    pub resource_type: String,
    pub action: String,
    pub endpoint_path: String,
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub payload: Option<Value>,
    pub http_method: Method,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
}

impl QueuedOperation {
    /// The request that replays this operation.
    pub fn to_request(&self) -> ApiRequest {
        let mut request = ApiRequest::new(self.http_method, self.endpoint_path.clone())
            .describing(self.resource_type.clone(), self.action.clone())
            .as_replay(self.id);
        request.body = self.payload.clone();
        request.query = self.query.clone();
        request
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub resource_type: String,
    pub action: String,
    pub endpoint_path: String,
    pub query: Option<Value>,
    pub payload: Option<Value>,
    pub http_method: Method,
}

impl NewOperation {
    /// Falls back to the first path segment and the method when the request
    /// carries no domain labels.
    pub fn from_request(request: &ApiRequest) -> Self {
        let resource_type = request.resource_type.clone().unwrap_or_else(|| {
            request
                .path
                .trim_start_matches('/')
                .split('/')
                .find(|segment| !segment.is_empty() && *segment != "api")
                .unwrap_or("request")
                .to_string()
        });
        let action = request
            .action
            .clone()
            .unwrap_or_else(|| request.method.as_str().to_ascii_lowercase());

        Self {
            resource_type,
            action,
            endpoint_path: request.path.clone(),
            query: request.query.clone(),
            payload: request.body.clone(),
            http_method: request.method,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Completed { response: Value },
    /// Non-retryable (4xx); removed.
    Rejected { reason: String },
    /// Transient failure; kept for the next drain.
    Retained { reason: String },
    /// Hit the attempt ceiling; removed.
    Abandoned { error: TransportError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub operation: QueuedOperation,
    pub status: OperationStatus,
}

/// Sends a queued operation back through the transport.
#[async_trait]
pub trait OperationReplayer: Send + Sync {
    async fn replay(&self, operation: &QueuedOperation) -> Result<ApiResponse, TransportError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    operations: Vec<QueuedOperation>,
    next_id: u64,
}

#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<QueueState>,
    drain_lock: tokio::sync::Mutex<()>,
    device: Mutex<Option<watch::Receiver<bool>>>,
    max_attempts: u32,
    counters: Arc<RuntimeCounters>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, counters: Arc<RuntimeCounters>) -> Result<Self> {
        let operations: Vec<QueuedOperation> =
            store::load(store.as_ref(), PENDING_OPERATIONS_KEY)?.unwrap_or_default();
        let persisted_seq: u64 =
            store::load(store.as_ref(), PENDING_SEQUENCE_KEY)?.unwrap_or(1);
        let next_id = operations
            .iter()
            .map(|operation| operation.id + 1)
            .max()
            .unwrap_or(1)
            .max(persisted_seq);

        if !operations.is_empty() {
            tracing::info!(pending = operations.len(), "restored offline operations");
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                state: Mutex::new(QueueState {
                    operations,
                    next_id,
                }),
                drain_lock: tokio::sync::Mutex::new(()),
                device: Mutex::new(None),
                max_attempts: MAX_REPLAY_ATTEMPTS,
                counters,
            }),
        })
    }

    /// Drains become no-ops while this signal reports the device offline.
    pub fn attach_device_signal(&self, device: watch::Receiver<bool>) {
        *self.inner.device.lock().expect("queue device lock poisoned") = Some(device);
    }

    pub fn enqueue(&self, operation: NewOperation) -> Result<u64> {
        let id = {
            let mut state = self.inner.lock_state();
            let id = state.next_id;
            state.next_id += 1;
            state.operations.push(QueuedOperation {
                id,
                resource_type: operation.resource_type,
                action: operation.action,
                endpoint_path: operation.endpoint_path,
                query: operation.query,
                payload: operation.payload,
                http_method: operation.http_method,
                attempts: 0,
                last_attempt_at: None,
                queued_at: Utc::now(),
            });
            if let Err(err) = self.inner.persist(&state) {
                state.operations.pop();
                return Err(err);
            }
            id
        };

        self.inner.counters.inc_operations_queued();
        tracing::info!(operation_id = id, pending = self.len(), "operation queued for replay");
        Ok(id)
    }

    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.inner.lock_state().operations.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.inner.lock_state();
        state.operations.clear();
        self.inner.persist(&state)
    }

    /// Replays pending operations in submission order.
    ///
    /// Concurrent callers are serialised. The pass stops at the first operation
    /// that stays queued so later operations never overtake it.
    pub async fn drain(&self, replayer: &dyn OperationReplayer) -> Vec<OperationResult> {
        let _drain = self.inner.drain_lock.lock().await;

        if !self.inner.device_online() {
            tracing::debug!("skipping queue drain while device is offline");
            return Vec::new();
        }

        let ids: Vec<u64> = self
            .inner
            .lock_state()
            .operations
            .iter()
            .map(|operation| operation.id)
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }
        tracing::info!(pending = ids.len(), "draining offline queue");

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(operation) = self.inner.begin_attempt(id) else {
                continue;
            };

            let outcome = replayer.replay(&operation).await;
            let status = match outcome {
                Ok(response) => {
                    self.inner.remove(id);
                    self.inner.counters.inc_operations_replayed();
                    tracing::info!(operation_id = id, attempts = operation.attempts, "queued operation replayed");
                    OperationStatus::Completed {
                        response: response.data,
                    }
                }
                Err(err) if matches!(err.kind, ErrorKind::ClientError(_)) => {
                    self.inner.remove(id);
                    self.inner.counters.inc_operations_rejected();
                    tracing::warn!(operation_id = id, error = %err, "queued operation rejected by server");
                    OperationStatus::Rejected {
                        reason: err.detail.clone().unwrap_or(err.message),
                    }
                }
                Err(err) if operation.attempts >= self.inner.max_attempts => {
                    self.inner.remove(id);
                    self.inner.counters.inc_operations_abandoned();
                    tracing::warn!(
                        operation_id = id,
                        attempts = operation.attempts,
                        error = %err,
                        "queued operation abandoned after maximum attempts"
                    );
                    let abandoned = TransportError::from_kind(ErrorKind::QueueAbandoned)
                        .with_detail(err.detail.clone().unwrap_or(err.message));
                    OperationStatus::Abandoned { error: abandoned }
                }
                Err(err) => {
                    tracing::info!(
                        operation_id = id,
                        attempts = operation.attempts,
                        error = %err,
                        "queued operation kept for a later drain"
                    );
                    results.push(OperationResult {
                        operation,
                        status: OperationStatus::Retained {
                            reason: err.message,
                        },
                    });
                    break;
                }
            };
            results.push(OperationResult { operation, status });
        }
        results
    }

    /// Drains whenever the monitor reports the device online or the server reachable.
    pub fn spawn_auto_drain(
        &self,
        monitor: &ConnectivityMonitor,
        replayer: Arc<dyn OperationReplayer>,
        timers: &TimerRegistry,
    ) -> (TimerHandle, Subscription) {
        let wake = Arc::new(Notify::new());
        let subscription = {
            let wake = wake.clone();
            monitor.subscribe(move |event| {
                if matches!(
                    event,
                    ConnectivityEvent::Online | ConnectivityEvent::ServerReachable { .. }
                ) {
                    wake.notify_one();
                }
            })
        };

        let queue = self.clone();
        let handle = timers.spawn("offline-queue-drain", move |shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wake.notified() => {
                        if queue.is_empty() {
                            continue;
                        }
                        let results = queue.drain(replayer.as_ref()).await;
                        let completed = results
                            .iter()
                            .filter(|result| matches!(result.status, OperationStatus::Completed { .. }))
                            .count();
                        tracing::info!(
                            processed = results.len(),
                            completed,
                            remaining = queue.len(),
                            "automatic queue drain finished"
                        );
                    }
                }
            }
        });
        (handle, subscription)
    }
}

impl QueueInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("offline queue lock poisoned")
    }

    fn device_online(&self) -> bool {
        self.device
            .lock()
            .expect("queue device lock poisoned")
            .as_ref()
            .map_or(true, |device| *device.borrow())
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        store::save(self.store.as_ref(), PENDING_OPERATIONS_KEY, &state.operations)?;
        store::save(self.store.as_ref(), PENDING_SEQUENCE_KEY, &state.next_id)
    }

    fn persist_or_log(&self, state: &QueueState) {
        if let Err(err) = self.persist(state) {
            tracing::error!(error = %err, "failed to persist offline queue");
        }
    }

    fn begin_attempt(&self, id: u64) -> Option<QueuedOperation> {
        let mut state = self.lock_state();
        let operation = state
            .operations
            .iter_mut()
            .find(|operation| operation.id == id)?;
        operation.attempts += 1;
        operation.last_attempt_at = Some(Utc::now());
        let snapshot = operation.clone();
        self.persist_or_log(&state);
        Some(snapshot)
    }

    fn remove(&self, id: u64) {
        let mut state = self.lock_state();
        state.operations.retain(|operation| operation.id != id);
        self.persist_or_log(&state);
    }
}
