use crate::channel::{ChannelConnector, ChannelManager, ChannelSettings, WsConnector};
use crate::config::NetworkConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Context, Result};
use crate::events::Subscription;
use crate::health::{HealthThresholds, MetricsAggregator};
use crate::queue::{OfflineQueue, OperationReplayer, OperationResult};
use crate::runtime::{sleep_with_shutdown, TimerRegistry};
use crate::store::{FileStore, KeyValueStore, MemoryStore, ResponseCache};
use crate::telemetry::RuntimeCounters;
use crate::transport::{
    ApiRequest, ApiResponse, AuthProvider, HttpBackend, ReqwestBackend, TransportDeps,
    TransportError, TransportExecutor,
};
use std::sync::{Arc, Mutex};

/// Platform collaborators injected into [`NetworkAccess`].
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub backend: Arc<dyn HttpBackend>,
    pub connector: Arc<dyn ChannelConnector>,
    pub auth: Arc<dyn AuthProvider>,
}

impl Collaborators {
    /// reqwest + tokio-tungstenite, persisting to `config.store_path` when set.
    pub fn production(config: &NetworkConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.store_path {
            Some(path) => Arc::new(
                FileStore::open(path)
                    .with_context(|| format!("failed to open store {}", path.display()))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self {
            store,
            backend: Arc::new(ReqwestBackend::new()?),
            connector: Arc::new(WsConnector),
            auth,
        })
    }
}

/// Wires the network access layer together and owns its background timers.
pub struct NetworkAccess {
    config: NetworkConfig,
    counters: Arc<RuntimeCounters>,
    aggregator: MetricsAggregator,
    monitor: ConnectivityMonitor,
    cache: ResponseCache,
    queue: OfflineQueue,
    executor: TransportExecutor,
    channel: ChannelManager,
    timers: TimerRegistry,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl NetworkAccess {
    pub fn initialise(config: NetworkConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let collaborators = Collaborators::production(&config, auth)?;
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: NetworkConfig, parts: Collaborators) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(RuntimeCounters::default());
        let aggregator =
            MetricsAggregator::persistent(HealthThresholds::default(), parts.store.clone())
                .context("failed to restore endpoint metrics")?;
        let monitor = ConnectivityMonitor::new(
            &config,
            parts.store.clone(),
            parts.backend.clone(),
            aggregator.clone(),
            counters.clone(),
        )
        .context("failed to construct connectivity monitor")?;
        let cache = ResponseCache::new(
            parts.store.clone(),
            config.cache_duration,
            config.cache_enabled,
        );
        let queue = OfflineQueue::new(parts.store.clone(), counters.clone())
            .context("failed to restore offline queue")?;
        queue.attach_device_signal(monitor.device_signal());

        let executor = TransportExecutor::new(
            &config,
            TransportDeps {
                monitor: monitor.clone(),
                aggregator: aggregator.clone(),
                cache: cache.clone(),
                queue: queue.clone(),
                backend: parts.backend,
                auth: parts.auth.clone(),
                counters: counters.clone(),
            },
        );

        let timers = TimerRegistry::new();
        let channel = ChannelManager::new(
            ChannelSettings::from_config(&config.channel),
            parts.connector,
            parts.auth,
            monitor.clone(),
            aggregator.clone(),
            counters.clone(),
            timers.clone(),
        );

        Ok(Self {
            config,
            counters,
            aggregator,
            monitor,
            cache,
            queue,
            executor,
            channel,
            timers,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Starts probing, automatic queue drains, cache sweeps and the channel's
    /// network watch. Call once.
    pub fn start(&self) {
        self.monitor.spawn_probe_loop(&self.timers);

        let replayer: Arc<dyn OperationReplayer> = Arc::new(self.executor.clone());
        let (_, drain_subscription) =
            self.queue
                .spawn_auto_drain(&self.monitor, replayer, &self.timers);
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .push(drain_subscription);

        let cache = self.cache.clone();
        let interval = self.config.cache_sweep_interval;
        self.timers.spawn("cache-sweep", move |shutdown| async move {
            while !sleep_with_shutdown(interval, &shutdown).await {
                if let Err(err) = cache.sweep_expired() {
                    tracing::warn!(error = %err, "cache sweep failed");
                }
            }
        });

        self.channel.spawn_network_watch();

        tracing::info!(
            endpoint = %self.monitor.current_endpoint(),
            pending_operations = self.queue.len(),
            "network access layer started"
        );
    }

    pub async fn request(&self, request: ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        self.executor.execute(request).await
    }

    pub async fn drain_queue(&self) -> Vec<OperationResult> {
        self.queue.drain(&self.executor).await
    }

    /// Runs until Ctrl-C, then shuts down.
    pub async fn run(self) -> Result<()> {
        self.start();
        self.monitor.check_reachability().await;
        self.channel.connect().await;

        tracing::info!("questlink running; press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown signal received");

        self.shutdown();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.channel.disconnect();
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .clear();
        self.timers.shutdown();

        let counters = self.counters.snapshot();
        tracing::info!(
            requests = counters.requests,
            queued = counters.operations_queued,
            replayed = counters.operations_replayed,
            channel_connects = counters.channel_connects,
            "network access layer stopped"
        );
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn counters(&self) -> &Arc<RuntimeCounters> {
        &self.counters
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn executor(&self) -> &TransportExecutor {
        &self.executor
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }
}
