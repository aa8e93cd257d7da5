//! Listener registry shared by the connectivity monitor and the channel manager.
//!
//! Listeners are invoked synchronously on the emitting task, outside of any
//! registry lock. A listener that panics is logged and skipped; the remaining
//! listeners still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct ListenerRegistry<E> {
    inner: Arc<RegistryInner<E>>,
}

struct RegistryInner<E> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: RwLock<Vec<RegisteredListener<E>>>,
}

struct RegisteredListener<E> {
    id: u64,
    topic: Option<String>,
    listener: Listener<E>,
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<E: 'static> Unsubscribe for RegistryInner<E> {
    fn remove(&self, id: u64) {
        let mut guard = self.listeners.write().expect("listener registry lock poisoned");
        guard.retain(|entry| entry.id != id);
    }
}

/// Keeps a listener registered until dropped or explicitly cancelled.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn Unsubscribe>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Leaves the listener registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.registry = None;
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.registry.is_some())
            .finish()
    }
}

impl<E> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Send + Sync + 'static> ListenerRegistry<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers a listener for every event regardless of topic.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Registers a listener for a single topic.
    pub fn subscribe_topic<F>(&self, topic: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(topic.into()), Arc::new(listener))
    }

    fn register(&self, topic: Option<String>, listener: Listener<E>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .expect("listener registry lock poisoned")
            .push(RegisteredListener {
                id,
                topic,
                listener,
            });

        let weak: Weak<RegistryInner<E>> = Arc::downgrade(&self.inner);
        let registry: Weak<dyn Unsubscribe> = weak;
        Subscription {
            id,
            registry: Some(registry),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .read()
            .expect("listener registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to listeners of `topic` and to topic-agnostic listeners.
    /// Returns the number of listeners that completed without panicking.
    pub fn emit(&self, topic: &str, event: &E) -> usize {
        let targets: Vec<Listener<E>> = {
            let guard = self
                .inner
                .listeners
                .read()
                .expect("listener registry lock poisoned");
            guard
                .iter()
                .filter(|entry| entry.topic.as_deref().map_or(true, |t| t == topic))
                .map(|entry| entry.listener.clone())
                .collect()
        };

        let mut delivered = 0;
        for listener in targets {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        registry = self.inner.name,
                        topic = topic,
                        "event listener panicked; continuing with remaining listeners"
                    );
                }
            }
        }
        delivered
    }
}
