use crate::config::NetworkConfig;
use crate::connectivity::endpoints::{EndpointRef, EndpointRing};
use crate::connectivity::state::{ChangeReason, ConnectivityEvent, ConnectivityState};
use crate::error::Result;
use crate::events::{ListenerRegistry, Subscription};
use crate::health::{HealthObserver, HealthUpdate, MetricsAggregator};
use crate::runtime::{TimerHandle, TimerRegistry};
use crate::store::{self, KeyValueStore, SERVER_URL_KEY};
use crate::telemetry::RuntimeCounters;
use crate::transport::backend::{send_with_timeout, HttpBackend, HttpCall};
use crate::transport::request::Method;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

pub const HEALTH_CHECK_HEADER: &str = "X-Health-Check";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub health_path: String,
    pub probe_timeout: Duration,
    pub check_interval: Duration,
    /// Probe failures only move the selection once the last success is older than this.
    pub offline_threshold: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            health_path: config.health_path.clone(),
            probe_timeout: config.health_check_timeout,
            check_interval: config.connection_check_interval,
            offline_threshold: config.offline_threshold,
        }
    }
}

/// Owns [`ConnectivityState`]: device status, the selected base endpoint and
/// the reachability verdict. Cloning shares the same monitor.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    ring: EndpointRing,
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn HttpBackend>,
    aggregator: MetricsAggregator,
    listeners: ListenerRegistry<ConnectivityEvent>,
    device: watch::Sender<bool>,
    counters: Arc<RuntimeCounters>,
}

#[derive(Debug)]
struct MonitorState {
    cursor: usize,
    device_online: bool,
    last_success: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
    /// `None` until the first probe or request completes.
    server_reachable: Option<bool>,
    overall_healthy: bool,
}

impl ConnectivityMonitor {
    pub fn new(
        config: &NetworkConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn HttpBackend>,
        aggregator: MetricsAggregator,
        counters: Arc<RuntimeCounters>,
    ) -> Result<Self> {
        let ring = EndpointRing::new(&config.primary_endpoint, &config.fallback_endpoints)?;

        let cursor = match store::load::<String>(store.as_ref(), SERVER_URL_KEY) {
            Ok(Some(url)) => ring.position_of(&url).unwrap_or_else(|| {
                tracing::info!(endpoint = %url, "persisted endpoint no longer configured; using primary");
                0
            }),
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(error = %err, "failed to restore persisted endpoint; using primary");
                0
            }
        };

        let (device, _) = watch::channel(true);
        let inner = Arc::new(MonitorInner {
            ring,
            settings: MonitorSettings::from_config(config),
            state: Mutex::new(MonitorState {
                cursor,
                device_online: true,
                last_success: None,
                last_success_at: None,
                server_reachable: None,
                overall_healthy: aggregator.overall_healthy(),
            }),
            store,
            backend,
            aggregator: aggregator.clone(),
            listeners: ListenerRegistry::new("connectivity"),
            device,
            counters,
        });

        let observer: Weak<MonitorInner> = Arc::downgrade(&inner);
        aggregator.set_observer(observer);

        tracing::info!(
            endpoint = %inner.ring.at(cursor),
            candidates = inner.ring.len(),
            "connectivity monitor initialised"
        );

        Ok(Self { inner })
    }

    pub fn endpoints(&self) -> &EndpointRing {
        &self.inner.ring
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    pub fn current_endpoint(&self) -> EndpointRef {
        let cursor = self.inner.lock_state().cursor;
        self.inner.ring.at(cursor)
    }

    /// Advances past `failed` and returns the new selection. If another caller already
    /// moved away from `failed`, the current selection is returned untouched.
    pub fn report_failure(&self, failed: &EndpointRef) -> EndpointRef {
        let next = self.inner.ring.next_after(failed.position);
        self.inner.switch(failed, next, ChangeReason::Unreachable)
    }

    pub fn record_success(&self, endpoint: &EndpointRef) {
        self.inner.mark_success(endpoint);
    }

    pub fn is_device_online(&self) -> bool {
        self.inner.lock_state().device_online
    }

    /// True when a success was observed within the offline threshold.
    pub fn is_server_reachable(&self) -> bool {
        let state = self.inner.lock_state();
        state
            .last_success
            .is_some_and(|at| at.elapsed() <= self.inner.settings.offline_threshold)
    }

    pub fn snapshot(&self) -> ConnectivityState {
        let state = self.inner.lock_state();
        ConnectivityState {
            device_online: state.device_online,
            selected_endpoint: self.inner.ring.at(state.cursor),
            last_success_at: state.last_success_at,
            healthy: state.server_reachable == Some(true) && state.overall_healthy,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn subscribe_topic<F>(&self, topic: &str, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe_topic(topic, listener)
    }

    /// Watch channel mirroring the device online flag.
    pub fn device_signal(&self) -> watch::Receiver<bool> {
        self.inner.device.subscribe()
    }

    /// Platform hook for device connectivity changes. Repeated values are ignored.
    pub fn set_device_online(&self, online: bool) {
        {
            let mut state = self.inner.lock_state();
            if state.device_online == online {
                return;
            }
            state.device_online = online;
        }

        self.inner.device.send_replace(online);
        if online {
            tracing::info!("device online");
            self.inner.emit(ConnectivityEvent::Online);
        } else {
            tracing::warn!("device offline");
            self.inner.emit(ConnectivityEvent::Offline);
        }
    }

    /// Probes `GET <endpoint><health_path>` on the selected endpoint.
    pub async fn check_reachability(&self) -> bool {
        let endpoint = {
            let state = self.inner.lock_state();
            if !state.device_online {
                return false;
            }
            self.inner.ring.at(state.cursor)
        };

        let call = HttpCall {
            method: Method::Get,
            url: endpoint.join(&self.inner.settings.health_path),
            headers: vec![
                ("Accept".to_string(), "application/json".to_string()),
                (HEALTH_CHECK_HEADER.to_string(), "true".to_string()),
            ],
            body: None,
            timeout: self.inner.settings.probe_timeout,
        };

        match send_with_timeout(self.inner.backend.as_ref(), call).await {
            Ok(reply) if reply.is_success() => {
                self.inner.mark_success(&endpoint);
                true
            }
            Ok(reply) => {
                tracing::warn!(endpoint = %endpoint, status = reply.status, "health probe rejected");
                self.inner.mark_failure(&endpoint);
                false
            }
            Err(err) => {
                tracing::warn!(endpoint = %endpoint, error = %err, "health probe failed");
                self.inner.mark_failure(&endpoint);
                false
            }
        }
    }

    /// Probes every `check_interval` while the device is online. Going offline
    /// suspends the loop; coming back online probes immediately.
    pub fn spawn_probe_loop(&self, timers: &TimerRegistry) -> TimerHandle {
        let monitor = self.clone();
        let mut device = self.device_signal();
        let interval = self.inner.settings.check_interval;

        timers.spawn("connectivity-probe", move |shutdown| async move {
            loop {
                let online = *device.borrow_and_update();
                if online {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(interval) => {
                            monitor.check_reachability().await;
                        }
                        changed = device.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                } else {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = device.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let back_online = *device.borrow();
                            if back_online {
                                monitor.check_reachability().await;
                            }
                        }
                    }
                }
            }
            tracing::debug!("connectivity probe loop stopped");
        })
    }
}

impl MonitorInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().expect("connectivity state lock poisoned")
    }

    fn emit(&self, event: ConnectivityEvent) {
        self.listeners.emit(event.topic(), &event);
    }

    /// Moves the selection from `from` to `to` unless it already moved.
    fn switch(&self, from: &EndpointRef, to: EndpointRef, reason: ChangeReason) -> EndpointRef {
        {
            let mut state = self.lock_state();
            if state.cursor != from.position {
                return self.ring.at(state.cursor);
            }
            if to.position == from.position {
                return to;
            }
            state.cursor = to.position;
        }

        if let Err(err) = store::save(self.store.as_ref(), SERVER_URL_KEY, &to.url) {
            tracing::warn!(error = %err, "failed to persist selected endpoint");
            self.emit(ConnectivityEvent::Error {
                message: format!("failed to persist selected endpoint: {err}"),
            });
        }
        self.counters.inc_endpoint_fallbacks();

        tracing::warn!(
            state_from = %from,
            state_to = %to,
            reason = reason.as_str(),
            "base endpoint switched"
        );
        self.emit(ConnectivityEvent::EndpointChanged {
            from: from.clone(),
            to: to.clone(),
            reason,
        });
        to
    }

    fn mark_success(&self, endpoint: &EndpointRef) {
        let became_reachable = {
            let mut state = self.lock_state();
            state.last_success = Some(Instant::now());
            state.last_success_at = Some(Utc::now());
            state.server_reachable.replace(true) != Some(true)
        };

        if became_reachable {
            tracing::info!(endpoint = %endpoint, "server reachable");
            self.emit(ConnectivityEvent::ServerReachable {
                endpoint: endpoint.clone(),
            });
        }
    }

    fn mark_failure(&self, endpoint: &EndpointRef) {
        let (stale, became_unreachable) = {
            let mut state = self.lock_state();
            let stale = state
                .last_success
                .map_or(true, |at| at.elapsed() > self.settings.offline_threshold);
            let became_unreachable = stale && state.server_reachable.replace(false) != Some(false);
            (stale, became_unreachable)
        };

        if !stale {
            tracing::debug!(endpoint = %endpoint, "probe failed within offline threshold; keeping endpoint");
            return;
        }

        let next = self.ring.next_after(endpoint.position);
        self.switch(endpoint, next, ChangeReason::Unreachable);

        if became_unreachable {
            tracing::warn!(endpoint = %endpoint, "server unreachable");
            self.emit(ConnectivityEvent::ServerUnreachable {
                endpoint: endpoint.clone(),
            });
        }
    }
}

impl HealthObserver for MonitorInner {
    fn on_health_update(&self, update: &HealthUpdate) {
        let current = {
            let mut state = self.lock_state();
            state.overall_healthy = update.overall_healthy;
            self.ring.at(state.cursor)
        };

        if !update.changed || update.endpoint_healthy || update.endpoint != current.url {
            return;
        }

        let candidate = (1..self.ring.len())
            .map(|offset| self.ring.at(current.position + offset))
            .find(|candidate| !self.aggregator.is_known_unhealthy(&candidate.url));

        match candidate {
            Some(candidate) => {
                self.switch(&current, candidate, ChangeReason::Unhealthy);
            }
            None => {
                tracing::warn!(endpoint = %current, "selected endpoint unhealthy and no healthy alternative");
            }
        }
    }
}
