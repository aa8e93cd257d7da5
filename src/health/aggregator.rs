use crate::error::Result;
use crate::health::window::RingBuffer;
use crate::store::{self, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;

pub const HISTORY_CAPACITY: usize = 100;
pub const METRICS_KEY: &str = "api_health_metrics";
/// Endpoint label carried by the process-wide totals.
pub const TOTALS_LABEL: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    ClientError,
    ServerError,
    Timeout,
    NetworkError,
}

impl OutcomeKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => OutcomeKind::Success,
            400..=499 => OutcomeKind::ClientError,
            _ => OutcomeKind::ServerError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::ClientError => "client_error",
            OutcomeKind::ServerError => "server_error",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::NetworkError => "network_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Failed / total at or above which an endpoint is unhealthy.
    pub error_rate: f64,
    pub timeout_rate: f64,
    pub average_latency: Duration,
    /// Share of unhealthy endpoints at or above which the service as a whole is unhealthy.
    pub unhealthy_share: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.2,
            timeout_rate: 0.1,
            average_latency: Duration::from_millis(2000),
            unhealthy_share: 0.2,
        }
    }
}

/// Returned by [`MetricsAggregator::start_tracking`]; consumed by `record_outcome`.
#[derive(Debug)]
pub struct TrackingHandle {
    endpoint: String,
    started: Instant,
}

impl TrackingHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Delivered to the observer after every recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthUpdate {
    pub endpoint: String,
    pub endpoint_healthy: bool,
    /// Set when this update flipped the endpoint's health.
    pub changed: bool,
    pub overall_healthy: bool,
}

pub trait HealthObserver: Send + Sync {
    fn on_health_update(&self, update: &HealthUpdate);
}

#[derive(Debug, Clone)]
struct EndpointMetrics {
    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    network_error_count: u64,
    server_error_count: u64,
    client_error_count: u64,
    avg_latency_ms: f64,
    recent_latencies: RingBuffer<Duration>,
    recent_error_rate: RingBuffer<f64>,
    healthy: bool,
    last_updated: DateTime<Utc>,
}

impl EndpointMetrics {
    fn new() -> Self {
        Self {
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            network_error_count: 0,
            server_error_count: 0,
            client_error_count: 0,
            avg_latency_ms: 0.0,
            recent_latencies: RingBuffer::new(HISTORY_CAPACITY),
            recent_error_rate: RingBuffer::new(HISTORY_CAPACITY),
            healthy: true,
            last_updated: Utc::now(),
        }
    }

    fn record(&mut self, outcome: OutcomeKind, latency: Duration) {
        self.total_requests += 1;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.total_requests as f64;
        self.recent_latencies.push(latency);

        match outcome {
            OutcomeKind::Success => self.success_count += 1,
            OutcomeKind::ClientError => self.client_error_count += 1,
            OutcomeKind::ServerError => self.server_error_count += 1,
            OutcomeKind::Timeout => self.timeout_count += 1,
            OutcomeKind::NetworkError => self.network_error_count += 1,
        }
        if outcome != OutcomeKind::Success {
            self.failure_count += 1;
        }

        self.recent_error_rate.push(self.error_rate());
        self.last_updated = Utc::now();
    }

    fn error_rate(&self) -> f64 {
        ratio(self.failure_count, self.total_requests)
    }

    fn timeout_rate(&self) -> f64 {
        ratio(self.timeout_count, self.total_requests)
    }

    fn evaluate(&self, thresholds: &HealthThresholds) -> bool {
        self.error_rate() < thresholds.error_rate
            && self.timeout_rate() < thresholds.timeout_rate
            && self.avg_latency_ms < thresholds.average_latency.as_secs_f64() * 1000.0
    }

    fn restore(snapshot: &EndpointSnapshot) -> Self {
        let mut recent_latencies = RingBuffer::new(HISTORY_CAPACITY);
        for ms in &snapshot.recent_latencies_ms {
            recent_latencies.push(Duration::from_millis(*ms));
        }
        let mut recent_error_rate = RingBuffer::new(HISTORY_CAPACITY);
        for rate in &snapshot.recent_error_rate {
            recent_error_rate.push(*rate);
        }
        Self {
            total_requests: snapshot.total_requests,
            success_count: snapshot.success_count,
            failure_count: snapshot.failure_count,
            timeout_count: snapshot.timeout_count,
            network_error_count: snapshot.network_error_count,
            server_error_count: snapshot.server_error_count,
            client_error_count: snapshot.client_error_count,
            avg_latency_ms: snapshot.avg_latency_ms,
            recent_latencies,
            recent_error_rate,
            healthy: snapshot.healthy,
            last_updated: snapshot.last_updated,
        }
    }

    fn snapshot(&self, endpoint: &str) -> EndpointSnapshot {
        EndpointSnapshot {
            endpoint: endpoint.to_string(),
            total_requests: self.total_requests,
            success_count: self.success_count,
            failure_count: self.failure_count,
            timeout_count: self.timeout_count,
            network_error_count: self.network_error_count,
            server_error_count: self.server_error_count,
            client_error_count: self.client_error_count,
            avg_latency_ms: self.avg_latency_ms,
            error_rate: self.error_rate(),
            timeout_rate: self.timeout_rate(),
            recent_latencies_ms: self
                .recent_latencies
                .iter()
                .map(|latency| latency.as_millis() as u64)
                .collect(),
            recent_error_rate: self.recent_error_rate.iter().copied().collect(),
            healthy: self.healthy,
            last_updated: self.last_updated,
        }
    }
}

fn ratio(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub network_error_count: u64,
    pub server_error_count: u64,
    pub client_error_count: u64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub timeout_rate: f64,
    pub recent_latencies_ms: Vec<u64>,
    pub recent_error_rate: Vec<f64>,
    pub healthy: bool,
    pub last_updated: DateTime<Utc>,
}

/// One overall-health reading, appended after every recompute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthPoint {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
}

/// Process-wide view; also the persisted form under [`METRICS_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub totals: EndpointSnapshot,
    pub endpoints: Vec<EndpointSnapshot>,
    pub healthy: bool,
    pub health_history: Vec<HealthPoint>,
}

/// Rolling request statistics keyed by endpoint.
///
/// Cloning is cheap; clones share the same statistics.
#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    thresholds: HealthThresholds,
    state: Mutex<MetricsState>,
    observer: RwLock<Option<Weak<dyn HealthObserver>>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

struct MetricsState {
    totals: EndpointMetrics,
    endpoints: HashMap<String, EndpointMetrics>,
    health_history: RingBuffer<HealthPoint>,
}

impl MetricsState {
    fn empty() -> Self {
        Self {
            totals: EndpointMetrics::new(),
            endpoints: HashMap::new(),
            health_history: RingBuffer::new(HISTORY_CAPACITY),
        }
    }

    fn restore(snapshot: &AggregateSnapshot) -> Self {
        let mut health_history = RingBuffer::new(HISTORY_CAPACITY);
        for point in &snapshot.health_history {
            health_history.push(*point);
        }
        Self {
            totals: EndpointMetrics::restore(&snapshot.totals),
            endpoints: snapshot
                .endpoints
                .iter()
                .map(|metrics| (metrics.endpoint.clone(), EndpointMetrics::restore(metrics)))
                .collect(),
            health_history,
        }
    }

    fn snapshot(&self, thresholds: &HealthThresholds) -> AggregateSnapshot {
        let mut endpoints: Vec<_> = self
            .endpoints
            .iter()
            .map(|(endpoint, metrics)| metrics.snapshot(endpoint))
            .collect();
        endpoints.sort_by(|lhs, rhs| lhs.endpoint.cmp(&rhs.endpoint));
        AggregateSnapshot {
            totals: self.totals.snapshot(TOTALS_LABEL),
            endpoints,
            healthy: overall(&self.endpoints, thresholds),
            health_history: self.health_history.iter().copied().collect(),
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl MetricsAggregator {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                thresholds,
                state: Mutex::new(MetricsState::empty()),
                observer: RwLock::new(None),
                store: None,
            }),
        }
    }

    /// Restores statistics saved under [`METRICS_KEY`] and saves them again
    /// after every recorded outcome. A malformed saved document is discarded.
    pub fn persistent(thresholds: HealthThresholds, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let state = match store::load::<AggregateSnapshot>(store.as_ref(), METRICS_KEY) {
            Ok(Some(saved)) => {
                tracing::info!(
                    endpoints = saved.endpoints.len(),
                    total_requests = saved.totals.total_requests,
                    "restored endpoint metrics"
                );
                MetricsState::restore(&saved)
            }
            Ok(None) => MetricsState::empty(),
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable endpoint metrics");
                store.remove(METRICS_KEY)?;
                MetricsState::empty()
            }
        };

        Ok(Self {
            inner: Arc::new(AggregatorInner {
                thresholds,
                state: Mutex::new(state),
                observer: RwLock::new(None),
                store: Some(store),
            }),
        })
    }

    /// Registers the component notified after every recompute. Held weakly.
    pub fn set_observer(&self, observer: Weak<dyn HealthObserver>) {
        *self.inner.observer.write().expect("observer lock poisoned") = Some(observer);
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.inner.thresholds
    }

    pub fn start_tracking(&self, endpoint: impl Into<String>) -> TrackingHandle {
        TrackingHandle {
            endpoint: endpoint.into(),
            started: Instant::now(),
        }
    }

    pub fn record_outcome(&self, handle: TrackingHandle, outcome: OutcomeKind) -> HealthUpdate {
        let latency = handle.elapsed();
        self.record_sample(&handle.endpoint, outcome, latency)
    }

    /// Records an attempt whose latency was measured elsewhere.
    pub fn record_sample(
        &self,
        endpoint: &str,
        outcome: OutcomeKind,
        latency: Duration,
    ) -> HealthUpdate {
        let update = {
            let mut state = self.inner.lock_state();
            state.totals.record(outcome, latency);
            let metrics = state
                .endpoints
                .entry(endpoint.to_string())
                .or_insert_with(EndpointMetrics::new);
            metrics.record(outcome, latency);
            let healthy = metrics.evaluate(&self.inner.thresholds);
            let changed = healthy != metrics.healthy;
            metrics.healthy = healthy;

            let overall_healthy = overall(&state.endpoints, &self.inner.thresholds);
            state.totals.healthy = overall_healthy;
            state.health_history.push(HealthPoint {
                timestamp: Utc::now(),
                healthy: overall_healthy,
            });
            self.inner.persist(&state);

            HealthUpdate {
                endpoint: endpoint.to_string(),
                endpoint_healthy: healthy,
                changed,
                overall_healthy,
            }
        };

        if update.changed {
            tracing::info!(
                endpoint = %update.endpoint,
                outcome = outcome.as_str(),
                healthy = update.endpoint_healthy,
                overall_healthy = update.overall_healthy,
                "endpoint health changed"
            );
        }

        self.notify(&update);
        update
    }

    fn notify(&self, update: &HealthUpdate) {
        let observer = self
            .inner
            .observer
            .read()
            .expect("observer lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.on_health_update(update);
        }
    }

    /// Endpoints never observed are assumed healthy.
    pub fn is_healthy(&self, endpoint: &str) -> bool {
        self.inner
            .lock_state()
            .endpoints
            .get(endpoint)
            .map_or(true, |metrics| metrics.healthy)
    }

    pub fn is_known_unhealthy(&self, endpoint: &str) -> bool {
        !self.is_healthy(endpoint)
    }

    pub fn overall_healthy(&self) -> bool {
        overall(&self.inner.lock_state().endpoints, &self.inner.thresholds)
    }

    pub fn snapshot(&self, endpoint: &str) -> Option<EndpointSnapshot> {
        self.inner
            .lock_state()
            .endpoints
            .get(endpoint)
            .map(|metrics| metrics.snapshot(endpoint))
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.aggregate().endpoints
    }

    /// Totals across every endpoint plus the overall-health history, oldest first.
    pub fn aggregate(&self) -> AggregateSnapshot {
        self.inner.lock_state().snapshot(&self.inner.thresholds)
    }

    pub fn reset(&self) {
        let mut state = self.inner.lock_state();
        *state = MetricsState::empty();
        self.inner.persist(&state);
    }
}

impl AggregatorInner {
    fn lock_state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().expect("metrics lock poisoned")
    }

    /// Runs under the state lock so saved documents never go backwards.
    fn persist(&self, state: &MetricsState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store::save(store.as_ref(), METRICS_KEY, &state.snapshot(&self.thresholds)) {
            tracing::warn!(error = %err, "failed to persist endpoint metrics");
        }
    }
}

fn overall(endpoints: &HashMap<String, EndpointMetrics>, thresholds: &HealthThresholds) -> bool {
    if endpoints.is_empty() {
        return true;
    }
    let unhealthy = endpoints.values().filter(|metrics| !metrics.healthy).count();
    (unhealthy as f64 / endpoints.len() as f64) < thresholds.unhealthy_share
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(OutcomeKind::from_status(204), OutcomeKind::Success);
        assert_eq!(OutcomeKind::from_status(404), OutcomeKind::ClientError);
        assert_eq!(OutcomeKind::from_status(503), OutcomeKind::ServerError);
    }

    #[test]
    fn ring_buffers_cap_at_history_capacity() {
        let aggregator = MetricsAggregator::default();
        for _ in 0..(HISTORY_CAPACITY + 25) {
            aggregator.record_sample("http://a", OutcomeKind::Success, Duration::from_millis(5));
        }
        let snapshot = aggregator.snapshot("http://a").unwrap();
        assert_eq!(snapshot.total_requests, (HISTORY_CAPACITY + 25) as u64);
        assert_eq!(snapshot.recent_latencies_ms.len(), HISTORY_CAPACITY);
        assert_eq!(snapshot.recent_error_rate.len(), HISTORY_CAPACITY);
        assert_eq!(aggregator.aggregate().health_history.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn totals_span_every_endpoint() {
        let aggregator = MetricsAggregator::default();
        aggregator.record_sample("http://a", OutcomeKind::Success, Duration::from_millis(10));
        aggregator.record_sample("http://b", OutcomeKind::Timeout, Duration::from_millis(30));

        let aggregate = aggregator.aggregate();
        assert_eq!(aggregate.totals.endpoint, TOTALS_LABEL);
        assert_eq!(aggregate.totals.total_requests, 2);
        assert_eq!(aggregate.totals.timeout_count, 1);
        assert!((aggregate.totals.avg_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(aggregate.endpoints.len(), 2);

        aggregator.reset();
        assert_eq!(aggregator.aggregate().totals.total_requests, 0);
        assert!(aggregator.aggregate().health_history.is_empty());
    }
}
