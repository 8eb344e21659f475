//! Listener registry.
//!
//! Tracks registered callbacks and delivers events to them. Each callback is
//! isolated: a panicking listener is logged and skipped, and delivery to the
//! remaining listeners continues.

use dashmap::DashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Unique identifier of a registered listener.
pub type ListenerId = String;

/// A registered callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listener<K, T> {
    key: K,
    callback: Callback<T>,
}

/// Callbacks grouped by key.
///
/// Thread-safe and can be shared via `Arc`.
pub struct ListenerRegistry<K, T> {
    /// All listeners, keyed by listener ID.
    listeners: DashMap<ListenerId, Listener<K, T>>,
    /// Index of listener IDs by key, in registration order.
    by_key: DashMap<K, Vec<ListenerId>>,
}

impl<K, T> Default for ListenerRegistry<K, T>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            listeners: DashMap::new(),
            by_key: DashMap::new(),
        }
    }
}

impl<K, T> ListenerRegistry<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: 'static,
{
    /// Create a new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new registry wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a callback under `key`. Returns the listener ID.
    pub fn register(&self, key: K, callback: Callback<T>) -> ListenerId {
        let id = uuid::Uuid::new_v4().to_string();

        self.listeners.insert(
            id.clone(),
            Listener {
                key: key.clone(),
                callback,
            },
        );
        self.by_key.entry(key).or_default().push(id.clone());

        tracing::debug!(listener_id = %id, "Listener registered");
        id
    }

    /// Register a callback and return a handle that can remove it.
    pub fn subscribe(self: &Arc<Self>, key: K, callback: Callback<T>) -> Subscription
    where
        T: Send + Sync,
    {
        let id = self.register(key, callback);
        let registry: Weak<Self> = Arc::downgrade(self);
        let listener_id = id.clone();
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.unregister(&listener_id);
                }
            })),
        }
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        let Some((_, listener)) = self.listeners.remove(id) else {
            return false;
        };

        if let Some(mut ids) = self.by_key.get_mut(&listener.key) {
            ids.retain(|other| other != id);
            // Clean up empty entries
            if ids.is_empty() {
                drop(ids);
                self.by_key.remove(&listener.key);
            }
        }

        tracing::debug!(listener_id = %id, key = ?listener.key, "Listener unregistered");
        true
    }

    /// Deliver `event` to every listener registered under `key`.
    ///
    /// Returns the number of listeners that handled the event without
    /// panicking.
    pub fn notify(&self, key: &K, event: &T) -> usize {
        // Collect first so callbacks may (un)register without deadlocking.
        let callbacks: Vec<(ListenerId, Callback<T>)> = match self.by_key.get(key) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    self.listeners
                        .get(id)
                        .map(|l| (id.clone(), l.callback.clone()))
                })
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(listener_id = %id, key = ?key, "Listener panicked; continuing delivery");
                }
            }
        }
        delivered
    }

    /// Get the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Get the number of keys with at least one listener.
    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }
}

/// Handle returned when registering a listener.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: ListenerId,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop receiving events.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
