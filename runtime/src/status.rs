//! Observable, persisted [`SyncStatus`].

use crate::db::{keys, StateStore};
use crate::error::StateError;
use crate::listeners::{ListenerRegistry, Subscription};
use squad_engine::SyncStatus;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Owns the process-wide status, publishes every change and persists it.
pub struct StatusTracker {
    tx: watch::Sender<SyncStatus>,
    listeners: Arc<ListenerRegistry<(), SyncStatus>>,
    state: Arc<dyn StateStore>,
    persist_lock: Mutex<()>,
}

impl StatusTracker {
    /// Restore the persisted status, or start fresh.
    ///
    /// Process-scoped flags (online, enabled, background activity) are reset.
    pub async fn load(state: Arc<dyn StateStore>) -> Result<Self, StateError> {
        let mut status = match state.load(keys::STATUS).await? {
            Some(json) => match serde_json::from_str::<SyncStatus>(&json) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable sync status");
                    SyncStatus::default()
                }
            },
            None => SyncStatus::default(),
        };
        status.reset_transient();

        let (tx, _) = watch::channel(status);
        Ok(Self {
            tx,
            listeners: ListenerRegistry::new_shared(),
            state,
            persist_lock: Mutex::new(()),
        })
    }

    /// A copy of the current status.
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// A receiver that observes every change.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Register a change callback.
    pub fn on_change(&self, callback: impl Fn(&SyncStatus) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe((), Arc::new(callback))
    }

    /// Mutate the status, notify observers and persist.
    ///
    /// Persistence failures are logged, not returned: status is advisory.
    pub async fn update(&self, mutate: impl FnOnce(&mut SyncStatus)) -> SyncStatus {
        self.tx.send_modify(mutate);
        let status = self.current();
        self.listeners.notify(&(), &status);
        self.persist().await;
        status
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        // Serialize the latest value under the guard so writes never go backwards.
        let serialized = {
            let status = self.tx.borrow();
            serde_json::to_string(&*status)
        };
        let json = match serialized {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize sync status");
                return;
            }
        };
        if let Err(e) = self.state.save(keys::STATUS, &json).await {
            tracing::warn!(error = %e, "Failed to persist sync status");
        }
    }
}
