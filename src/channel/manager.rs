use crate::channel::socket::{
    ChannelConnector, ChannelFault, ChannelFrame, ChannelSocket, CloseInfo, SocketEvent,
    CLOSE_ABNORMAL, CLOSE_CONNECT_TIMEOUT, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PING_FAILED,
};
use crate::channel::state::ChannelState;
use crate::config::ChannelConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::events::{ListenerRegistry, Subscription};
use crate::health::{MetricsAggregator, OutcomeKind};
use crate::retry::ReconnectBackoff;
use crate::runtime::{sleep_with_shutdown, TimerHandle, TimerRegistry};
use crate::telemetry::RuntimeCounters;
use crate::transport::{AuthProvider, ErrorKind};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

const USER_DISCONNECT_REASON: &str = "User disconnected";
const NO_RECONNECT_MARKER: &str = "no-reconnect";
const REJECTION_ATTEMPTS: u32 = 3;
const MAX_ATTEMPTS_MESSAGE: &str = "Max reconnection attempts reached. Please refresh the page.";
const REJECTION_MESSAGE: &str =
    "Connection keeps closing right after opening; the server is likely rejecting it.";
const MISSING_TOKEN_MESSAGE: &str = "Authentication token not available";

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub url: Option<String>,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub short_lived_threshold: Duration,
    pub backoff: ReconnectBackoff,
}

impl ChannelSettings {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout,
            ping_interval: config.ping_interval,
            max_reconnect_attempts: config.max_reconnect_attempts,
            short_lived_threshold: config.short_lived_threshold,
            backoff: ReconnectBackoff::from_config(config),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected { code: u16, reason: String },
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connection(ConnectionStatus),
    /// Server frame; delivered under its own `type` as the topic.
    Message { kind: String, data: Value },
    /// `kind` is set when the failure maps onto the transport taxonomy.
    Error {
        message: String,
        fatal: bool,
        kind: Option<ErrorKind>,
    },
    Network { online: bool },
    Reconnect { attempt: u32, delay: Duration },
}

impl ChannelEvent {
    pub fn topic(&self) -> &str {
        match self {
            ChannelEvent::Connection(_) => "connection",
            ChannelEvent::Message { kind, .. } => kind,
            ChannelEvent::Error { .. } => "error",
            ChannelEvent::Network { .. } => "network",
            ChannelEvent::Reconnect { .. } => "reconnect",
        }
    }
}

/// Owns the single duplex connection and its reconnect schedule.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    settings: ChannelSettings,
    connector: Arc<dyn ChannelConnector>,
    auth: Arc<dyn AuthProvider>,
    monitor: ConnectivityMonitor,
    aggregator: MetricsAggregator,
    counters: Arc<RuntimeCounters>,
    timers: TimerRegistry,
    listeners: ListenerRegistry<ChannelEvent>,
    shared: Mutex<ChannelShared>,
}

#[derive(Default)]
struct ChannelShared {
    state: ChannelState,
    attempts: u32,
    started_at: Option<Instant>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    connection: Option<TimerHandle>,
    reconnect: Option<TimerHandle>,
    /// Set when the connection dropped while the device was offline.
    resume_on_online: bool,
    /// Bumped for every attempt and on disconnect; stale tasks compare against it.
    generation: u64,
}

enum CloseDecision {
    Reconnect { attempt: u32, delay: Duration },
    Failed,
    Stop { rejected: bool },
}

enum Step {
    Shutdown,
    Outbound(String),
    Inbound(SocketEvent),
    Ping,
}

impl ChannelManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ChannelSettings,
        connector: Arc<dyn ChannelConnector>,
        auth: Arc<dyn AuthProvider>,
        monitor: ConnectivityMonitor,
        aggregator: MetricsAggregator,
        counters: Arc<RuntimeCounters>,
        timers: TimerRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                settings,
                connector,
                auth,
                monitor,
                aggregator,
                counters,
                timers,
                listeners: ListenerRegistry::new("channel"),
                shared: Mutex::new(ChannelShared::default()),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock_shared().state
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock_shared().attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    /// `topic` is `connection`, `error`, `network`, `reconnect` or a server frame type.
    pub fn subscribe_topic<F>(&self, topic: &str, listener: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe_topic(topic, listener)
    }

    /// Opens the channel unless an attempt is already in flight or connected.
    /// From `Failed` this starts over with a fresh attempt counter.
    pub async fn connect(&self) {
        if !self.inner.monitor.is_device_online() {
            tracing::info!("device offline; channel connect deferred");
            self.inner
                .emit(ChannelEvent::Connection(ConnectionStatus::Offline));
            return;
        }

        {
            let mut shared = self.inner.lock_shared();
            if shared.state.is_active() {
                tracing::debug!(state = shared.state.as_str(), "channel already connecting or connected");
                return;
            }
            if shared.state == ChannelState::Failed {
                shared.attempts = 0;
            }
        }

        self.inner.open().await;
    }

    /// Closes with 1000 and cancels keep-alive and any pending reconnect.
    pub fn disconnect(&self) {
        let (connection, reconnect) = {
            let mut shared = self.inner.lock_shared();
            shared.generation += 1;
            shared.state = ChannelState::Disconnected;
            shared.attempts = 0;
            shared.outbound = None;
            shared.started_at = None;
            shared.resume_on_online = false;
            (shared.connection.take(), shared.reconnect.take())
        };
        for handle in connection.into_iter().chain(reconnect) {
            handle.cancel();
        }

        tracing::info!("channel disconnected by user");
        self.inner
            .emit(ChannelEvent::Connection(ConnectionStatus::Disconnected {
                code: CLOSE_NORMAL,
                reason: USER_DISCONNECT_REASON.to_string(),
            }));
    }

    /// Queues a `{type, data}` frame. Returns `false` unless connected.
    pub fn send(&self, kind: &str, data: Value) -> bool {
        let outbound = {
            let shared = self.inner.lock_shared();
            if shared.state != ChannelState::Connected {
                return false;
            }
            shared.outbound.clone()
        };
        let Some(outbound) = outbound else {
            return false;
        };

        match serde_json::to_string(&ChannelFrame::new(kind, data)) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(err) => {
                tracing::warn!(kind = kind, error = %err, "failed to encode channel frame");
                false
            }
        }
    }

    pub fn mark_notification_read(&self, notification_id: &str) -> bool {
        self.send(
            "mark_notification_read",
            json!({ "notificationId": notification_id }),
        )
    }

    pub fn mark_notification_displayed(&self, notification_id: &str) -> bool {
        self.send(
            "mark_notification_displayed",
            json!({ "notificationId": notification_id }),
        )
    }

    /// Follows device connectivity: announces transitions and reconnects
    /// immediately when the device returns while a reconnect is pending.
    pub fn spawn_network_watch(&self) -> TimerHandle {
        let inner = self.inner.clone();
        let mut device = inner.monitor.device_signal();
        self.inner
            .timers
            .spawn("channel-network-watch", move |shutdown| async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = device.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let online = *device.borrow_and_update();
                            inner.on_network_change(online).await;
                        }
                    }
                }
            })
    }
}

impl ChannelInner {
    fn lock_shared(&self) -> std::sync::MutexGuard<'_, ChannelShared> {
        self.shared.lock().expect("channel state lock poisoned")
    }

    fn emit(&self, event: ChannelEvent) {
        self.listeners.emit(event.topic(), &event);
    }

    fn emit_error(&self, message: impl Into<String>, fatal: bool) {
        self.emit(ChannelEvent::Error {
            message: message.into(),
            fatal,
            kind: None,
        });
    }

    fn set_state(shared: &mut ChannelShared, next: ChannelState) {
        if !ChannelState::is_valid_transition(shared.state, next) {
            tracing::debug!(
                state_from = shared.state.as_str(),
                state_to = next.as_str(),
                "unexpected channel transition"
            );
        }
        shared.state = next;
    }

    /// Returns the dial URL (with token) and the token-free URL used for metrics.
    fn channel_url(&self, token: &str) -> Result<(String, String), ChannelFault> {
        let (base, derived) = match &self.settings.url {
            Some(url) => (url.clone(), false),
            None => (self.monitor.current_endpoint().url, true),
        };
        let mut url = Url::parse(&base).map_err(|err| ChannelFault::Url(format!("{base}: {err}")))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ChannelFault::Url(format!("unsupported scheme `{other}`"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ChannelFault::Url(format!("cannot use scheme `{scheme}` for {base}")))?;
        if derived {
            url.set_path("/ws");
            url.set_query(None);
        }

        let metrics_key = url.to_string();
        url.query_pairs_mut().append_pair("token", token);
        Ok((url.to_string(), metrics_key))
    }

    async fn open(self: &Arc<Self>) {
        let Some(token) = self.auth.token().await else {
            tracing::warn!("channel token unavailable");
            self.fall_back_to_disconnected();
            self.emit_error(MISSING_TOKEN_MESSAGE, false);
            return;
        };

        let (url, metrics_key) = match self.channel_url(&token) {
            Ok(urls) => urls,
            Err(err) => {
                tracing::error!(error = %err, "cannot build channel url");
                self.fall_back_to_disconnected();
                self.emit_error(err.to_string(), false);
                return;
            }
        };

        let (generation, attempts) = {
            let mut shared = self.lock_shared();
            if shared.state.is_active() {
                return;
            }
            shared.generation += 1;
            Self::set_state(&mut shared, ChannelState::Connecting);
            shared.started_at = Some(Instant::now());
            shared.resume_on_online = false;
            if let Some(reconnect) = shared.reconnect.take() {
                reconnect.cancel();
            }
            if let Some(stale) = shared.connection.take() {
                stale.cancel();
            }
            (shared.generation, shared.attempts)
        };

        crate::network_event!(info, "channel_connecting", endpoint = metrics_key, attempts = attempts);

        let inner = self.clone();
        let handle = self.timers.spawn("channel-connection", move |shutdown| async move {
            inner.run_connection(generation, url, metrics_key, shutdown).await;
        });

        let mut shared = self.lock_shared();
        if shared.generation == generation {
            shared.connection = Some(handle);
        } else {
            handle.cancel();
        }
    }

    fn fall_back_to_disconnected(&self) {
        let mut shared = self.lock_shared();
        if shared.state == ChannelState::Reconnecting {
            Self::set_state(&mut shared, ChannelState::Disconnected);
        }
    }

    async fn run_connection(
        self: Arc<Self>,
        generation: u64,
        url: String,
        metrics_key: String,
        shutdown: CancellationToken,
    ) {
        let tracking = self.aggregator.start_tracking(metrics_key.clone());
        let attempt = tokio::time::timeout(self.settings.connect_timeout, self.connector.connect(&url));
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = attempt => result,
        };

        let mut socket = match result {
            Ok(Ok(socket)) => {
                self.aggregator.record_outcome(tracking, OutcomeKind::Success);
                socket
            }
            Ok(Err(fault)) => {
                self.aggregator.record_outcome(tracking, OutcomeKind::NetworkError);
                crate::network_event!(warn, "channel_connect_failed", endpoint = metrics_key, error = fault);
                self.handle_close(generation, CloseInfo::new(CLOSE_ABNORMAL, fault.to_string()));
                return;
            }
            Err(_) => {
                self.aggregator.record_outcome(tracking, OutcomeKind::Timeout);
                crate::network_event!(
                    warn,
                    "channel_connect_timeout",
                    endpoint = metrics_key,
                    timeout_ms = self.settings.connect_timeout.as_millis()
                );
                self.handle_close(generation, CloseInfo::new(CLOSE_CONNECT_TIMEOUT, "Connection timeout"));
                return;
            }
        };

        let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
        if !self.on_open(generation, outbound_tx, &metrics_key) {
            socket.close(CLOSE_NORMAL, USER_DISCONNECT_REASON).await;
            return;
        }

        let handshake = ChannelFrame::new("handshake", json!({ "clientTime": Utc::now().timestamp_millis() }));
        if let Err(err) = send_frame(socket.as_mut(), &handshake).await {
            tracing::warn!(error = %err, "channel handshake failed");
        }

        let ping_interval = self.settings.ping_interval;
        let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let close = loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => Step::Shutdown,
                Some(text) = outbound.recv() => Step::Outbound(text),
                event = socket.next_event() => Step::Inbound(event),
                _ = keepalive.tick() => Step::Ping,
            };

            match step {
                Step::Shutdown => {
                    socket.close(CLOSE_NORMAL, USER_DISCONNECT_REASON).await;
                    return;
                }
                Step::Outbound(text) => {
                    if let Err(err) = socket.send_text(text).await {
                        tracing::warn!(error = %err, "channel send failed");
                    }
                }
                Step::Inbound(SocketEvent::Text(text)) => self.dispatch(&text),
                Step::Inbound(SocketEvent::Closed(info)) => break info,
                Step::Ping => {
                    let ping = ChannelFrame::ping(Utc::now().timestamp_millis());
                    if let Err(err) = send_frame(socket.as_mut(), &ping).await {
                        tracing::warn!(error = %err, "channel keep-alive failed");
                        socket.close(CLOSE_PING_FAILED, "Ping failed").await;
                        break CloseInfo::new(CLOSE_PING_FAILED, "Ping failed");
                    }
                }
            }
        };

        crate::network_event!(
            info,
            "channel_closed",
            endpoint = metrics_key,
            code = close.code,
            reason = close.reason
        );
        self.handle_close(generation, close);
    }

    fn on_open(&self, generation: u64, outbound: mpsc::UnboundedSender<String>, endpoint: &str) -> bool {
        {
            let mut shared = self.lock_shared();
            if shared.generation != generation || shared.state != ChannelState::Connecting {
                return false;
            }
            Self::set_state(&mut shared, ChannelState::Connected);
            shared.attempts = 0;
            shared.outbound = Some(outbound);
        }
        self.counters.inc_channel_connects();
        crate::network_event!(info, "channel_connected", endpoint = endpoint);
        self.emit(ChannelEvent::Connection(ConnectionStatus::Connected));
        true
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ChannelFrame>(text) {
            Ok(frame) => {
                tracing::trace!(kind = %frame.kind, "channel frame received");
                self.emit(ChannelEvent::Message {
                    kind: frame.kind,
                    data: frame.data,
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed channel frame");
            }
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, close: CloseInfo) {
        let decision = {
            let mut shared = self.lock_shared();
            if shared.generation != generation {
                return;
            }
            shared.outbound = None;
            shared.connection = None;

            let lived = shared
                .started_at
                .map(|started| started.elapsed())
                .unwrap_or_default();
            let short_lived = lived < self.settings.short_lived_threshold;
            let online = self.monitor.is_device_online();
            let normal = close.code == CLOSE_NORMAL || close.code == CLOSE_GOING_AWAY;
            let rejected = short_lived && shared.attempts >= REJECTION_ATTEMPTS;

            let reconnect = online
                && !normal
                && shared.attempts < self.settings.max_reconnect_attempts
                && !close.reason.contains(NO_RECONNECT_MARKER)
                && !rejected;

            if reconnect {
                let delay = self.settings.backoff.delay(shared.attempts, short_lived);
                Self::set_state(&mut shared, ChannelState::Reconnecting);
                CloseDecision::Reconnect {
                    attempt: shared.attempts + 1,
                    delay,
                }
            } else if shared.attempts >= self.settings.max_reconnect_attempts {
                Self::set_state(&mut shared, ChannelState::Failed);
                CloseDecision::Failed
            } else {
                Self::set_state(&mut shared, ChannelState::Disconnected);
                shared.resume_on_online = !online && !normal;
                CloseDecision::Stop { rejected }
            }
        };

        self.emit(ChannelEvent::Connection(ConnectionStatus::Disconnected {
            code: close.code,
            reason: close.reason.clone(),
        }));

        match decision {
            CloseDecision::Reconnect { attempt, delay } => {
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = close.code,
                    "scheduling channel reconnect"
                );
                self.schedule_reconnect(generation, delay);
                self.emit(ChannelEvent::Reconnect { attempt, delay });
            }
            CloseDecision::Failed => {
                tracing::error!(
                    attempts = self.settings.max_reconnect_attempts,
                    "channel reconnect attempts exhausted"
                );
                self.counters.inc_channel_failures();
                self.emit(ChannelEvent::Error {
                    message: MAX_ATTEMPTS_MESSAGE.to_string(),
                    fatal: true,
                    kind: Some(ErrorKind::ChannelFailed),
                });
            }
            CloseDecision::Stop { rejected: true } => {
                tracing::warn!(code = close.code, reason = %close.reason, "channel rejected repeatedly; not reconnecting");
                self.emit_error(REJECTION_MESSAGE, false);
            }
            CloseDecision::Stop { rejected: false } => {}
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64, delay: Duration) {
        let inner = self.clone();
        let handle = self.timers.spawn("channel-reconnect", move |shutdown| async move {
            if sleep_with_shutdown(delay, &shutdown).await {
                return;
            }
            inner.fire_reconnect(generation).await;
        });

        let mut shared = self.lock_shared();
        if shared.generation == generation && shared.state == ChannelState::Reconnecting {
            if let Some(previous) = shared.reconnect.replace(handle) {
                previous.cancel();
            }
        } else {
            handle.cancel();
        }
    }

    async fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let online = self.monitor.is_device_online();
        {
            let mut shared = self.lock_shared();
            if shared.generation != generation || shared.state != ChannelState::Reconnecting {
                return;
            }
            shared.attempts += 1;
            shared.reconnect = None;
            if !online {
                Self::set_state(&mut shared, ChannelState::Disconnected);
                shared.resume_on_online = true;
            }
        }

        if !online {
            tracing::info!("device offline at reconnect time; waiting for network");
            self.emit(ChannelEvent::Connection(ConnectionStatus::Offline));
            return;
        }
        self.counters.inc_channel_reconnects();
        self.open().await;
    }

    async fn on_network_change(self: &Arc<Self>, online: bool) {
        self.emit(ChannelEvent::Network { online });
        if !online {
            return;
        }

        let resume = {
            let mut shared = self.lock_shared();
            let resume = shared.state == ChannelState::Reconnecting
                || (shared.state == ChannelState::Disconnected
                    && (shared.attempts > 0 || shared.resume_on_online));
            if resume {
                if let Some(reconnect) = shared.reconnect.take() {
                    reconnect.cancel();
                }
            }
            resume
        };

        if resume {
            tracing::info!("device back online; reconnecting channel now");
            self.open().await;
        }
    }
}

async fn send_frame(socket: &mut dyn ChannelSocket, frame: &ChannelFrame) -> Result<(), ChannelFault> {
    let text = serde_json::to_string(frame).map_err(|err| ChannelFault::Send(err.to_string()))?;
    socket.send_text(text).await
}
