//! Listener registry for breaker and statistics notifications
//!
//! Each component owns a [`Listeners`] list for the events it publishes.
//! Subscribing returns a [`Subscription`] that removes the listener when it is
//! dropped or cancelled, so nothing keeps a disposed breaker reachable.

use crate::stats::Snapshot;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Notifications published by a [`CircuitBreaker`](crate::CircuitBreaker)
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// An execution was requested (before the state check)
    Exec,
    Success { latency_ms: u64 },
    Failure { latency_ms: u64 },
    Timeout { latency_ms: u64 },
    Snapshot(Arc<Snapshot>),
    CircuitOpen,
    CircuitClosed,
    HealthCheckFailed { error: String },
}

impl BreakerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerEvent::Exec => "exec",
            BreakerEvent::Success { .. } => "success",
            BreakerEvent::Failure { .. } => "failure",
            BreakerEvent::Timeout { .. } => "timeout",
            BreakerEvent::Snapshot(_) => "snapshot",
            BreakerEvent::CircuitOpen => "circuitOpen",
            BreakerEvent::CircuitClosed => "circuitClosed",
            BreakerEvent::HealthCheckFailed { .. } => "healthCheckFailed",
        }
    }
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerSet<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener<E>)>>,
}

impl<E> ListenerSet<E> {
    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

/// Ordered list of listeners for events of type `E`
pub struct Listeners<E> {
    set: Arc<ListenerSet<E>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            set: Arc::new(ListenerSet {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener; it stays registered while the returned handle lives
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
        self.set.entries.lock().push((id, Arc::new(listener)));

        let set: Weak<ListenerSet<E>> = Arc::downgrade(&self.set);
        Subscription::new(move || {
            if let Some(set) = set.upgrade() {
                set.remove(id);
            }
        })
    }

    /// Invoke every listener in registration order
    ///
    /// The list is copied first so listeners may subscribe, unsubscribe or
    /// publish again without deadlocking.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .set
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.set.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener, including detached ones
    pub fn clear(&self) {
        self.set.entries.lock().clear();
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.set.entries.lock().len())
            .finish()
    }
}

/// Handle that unsubscribes its listener when dropped
#[must_use = "dropping a Subscription immediately removes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener now
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of its publisher
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
