#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Sleeps for a duration but aborts early if the shutdown token fires.
/// Returns `true` if shutdown occurred during the wait.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Owns every background timer (probe loops, keep-alives, reconnect delays, sweeps).
///
/// Each timer receives a child token of the registry root. Cancelling a single
/// [`TimerHandle`] stops that timer; [`TimerRegistry::shutdown`] stops all of them
/// and aborts any task that has not yet observed its token.
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<TimerRegistryInner>,
}

struct TimerRegistryInner {
    root: CancellationToken,
    tasks: Mutex<Vec<TrackedTimer>>,
}

struct TrackedTimer {
    name: &'static str,
    handle: JoinHandle<()>,
}

#[derive(Clone, Debug)]
pub struct TimerHandle {
    name: &'static str,
    token: CancellationToken,
}

impl TimerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::with_root(CancellationToken::new())
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry whose timers also stop when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_root(parent.child_token())
    }

    fn with_root(root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TimerRegistryInner {
                root,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn spawn<F, Fut>(&self, name: &'static str, task: F) -> TimerHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.root.child_token();
        let handle = tokio::spawn(task(token.clone()));

        let mut tasks = self.inner.tasks.lock().expect("timer registry lock poisoned");
        tasks.retain(|timer| !timer.handle.is_finished());
        tasks.push(TrackedTimer { name, handle });

        TimerHandle { name, token }
    }

    /// Timers that have not yet completed.
    pub fn active(&self) -> Vec<&'static str> {
        let tasks = self.inner.tasks.lock().expect("timer registry lock poisoned");
        tasks
            .iter()
            .filter(|timer| !timer.handle.is_finished())
            .map(|timer| timer.name)
            .collect()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.root.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.inner.root.cancel();
        let drained: Vec<TrackedTimer> = {
            let mut tasks = self.inner.tasks.lock().expect("timer registry lock poisoned");
            tasks.drain(..).collect()
        };
        for timer in drained {
            if !timer.handle.is_finished() {
                tracing::debug!(timer = timer.name, "aborting timer on shutdown");
                timer.handle.abort();
            }
        }
    }
}
