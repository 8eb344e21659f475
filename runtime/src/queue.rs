//! The durable operation queue service.
//!
//! Wraps the engine's [`SyncOperationQueue`] with persistence, status
//! bookkeeping and retry-timer tracking. Every mutation is flushed to the
//! state store before the queue lock is released, so snapshots are written
//! in mutation order and a crash never loses an acknowledged enqueue.

use crate::db::{keys, StateStore};
use crate::error::{Result, StateError};
use crate::status::StatusTracker;
use dashmap::DashMap;
use squad_engine::{
    Clock, EnqueueOutcome, EntityType, FailureOutcome, OperationId, OperationKind, Origin,
    Priority, QueueSnapshot, Record, RetryPolicy, SyncOperation, SyncOperationQueue, Timestamp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;

/// Persisted, observable pending-operation queue.
pub struct QueueService {
    queue: Mutex<SyncOperationQueue>,
    state: Arc<dyn StateStore>,
    status: Arc<StatusTracker>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    /// Backoff wake-ups, keyed by the operation they retry.
    retry_timers: DashMap<OperationId, AbortHandle>,
    high_priority: Notify,
    /// Set while the engine is online with auto sync enabled.
    high_priority_armed: AtomicBool,
}

impl QueueService {
    /// Restore the persisted queue.
    ///
    /// An unreadable snapshot is an error rather than an empty queue, so
    /// pending mutations are never silently discarded.
    pub async fn load(
        state: Arc<dyn StateStore>,
        status: Arc<StatusTracker>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> std::result::Result<Self, StateError> {
        let queue = match state.load(keys::QUEUE).await? {
            Some(json) => SyncOperationQueue::restore(QueueSnapshot::from_json(&json)?),
            None => SyncOperationQueue::new(),
        };
        let pending = queue.len();
        tracing::info!(pending, "Restored sync queue");
        status.update(|s| s.pending_operations = pending).await;

        Ok(Self {
            queue: Mutex::new(queue),
            state,
            status,
            clock,
            policy,
            retry_timers: DashMap::new(),
            high_priority: Notify::new(),
            high_priority_armed: AtomicBool::new(false),
        })
    }

    /// Build and enqueue an operation.
    ///
    /// Fails only on validation errors (missing payload, entity mismatch).
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity: EntityType,
        payload: Option<&Record>,
        priority: Priority,
        origin: Origin,
    ) -> Result<EnqueueOutcome> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let max_attempts = self.policy.max_attempts;

        let op = match kind {
            OperationKind::DownloadAll => SyncOperation::download_all(id, priority, now, max_attempts),
            _ => SyncOperation::new(id, kind, entity, payload, priority, now, max_attempts)?,
        };
        Ok(self.enqueue_operation(op.with_origin(origin)).await)
    }

    /// Enqueue a prepared operation, superseding any pending duplicate.
    pub async fn enqueue_operation(&self, op: SyncOperation) -> EnqueueOutcome {
        let priority = op.priority;
        let description = op.describe();

        let (outcome, pending) = {
            let mut queue = self.queue.lock().await;
            let outcome = queue.enqueue(op);
            self.persist(&queue).await;
            (outcome, queue.len())
        };

        for superseded in &outcome.superseded {
            self.cancel_retry_timer(&superseded.id);
            tracing::debug!(op_id = %superseded.id, by = %outcome.id, "Superseded pending operation");
        }
        let dropped = outcome.superseded.len();
        self.status
            .update(|s| {
                s.record_enqueued(pending);
                if dropped > 0 {
                    s.record_dropped(dropped, pending);
                }
            })
            .await;

        tracing::debug!(op_id = %outcome.id, priority = ?priority, pending, "Enqueued {description}");
        if priority == Priority::High && self.high_priority_armed.load(Ordering::SeqCst) {
            self.high_priority.notify_one();
        }
        outcome
    }

    /// Up to `limit` due operations in drain order, left in the queue.
    pub async fn dequeue_batch(&self, limit: usize) -> Vec<SyncOperation> {
        let now = self.clock.now();
        self.queue.lock().await.dequeue_batch(limit, now)
    }

    /// Whether an operation is still pending (not superseded or removed).
    pub async fn contains(&self, id: &str) -> bool {
        self.queue.lock().await.get(id).is_some()
    }

    /// Remove an operation that reached the remote.
    pub async fn complete(&self, id: &str) {
        let pending = {
            let mut queue = self.queue.lock().await;
            if queue.remove(&[id.to_string()]).is_empty() {
                return;
            }
            self.persist(&queue).await;
            queue.len()
        };
        self.cancel_retry_timer(id);
        self.status.update(|s| s.record_success(pending)).await;
    }

    /// Count a failed attempt: schedule a retry or abandon at the ceiling.
    pub async fn fail(&self, id: &str, error: &str) -> Option<FailureOutcome> {
        let now = self.clock.now();
        let (outcome, pending) = {
            let mut queue = self.queue.lock().await;
            let outcome = queue.record_failure(id, error, now, &self.policy)?;
            self.persist(&queue).await;
            (outcome, queue.len())
        };

        match &outcome {
            FailureOutcome::Retry {
                id,
                attempts,
                next_attempt_at,
            } => {
                tracing::warn!(
                    op_id = %id,
                    attempts,
                    retry_in_ms = next_attempt_at.saturating_sub(now),
                    error,
                    "Sync operation failed; retry scheduled"
                );
                let message = error.to_string();
                self.status.update(|s| s.record_retry(message, pending)).await;
            }
            FailureOutcome::Abandoned(op) => {
                self.cancel_retry_timer(&op.id);
                self.surface_abandoned(op, error, pending).await;
            }
        }
        Some(outcome)
    }

    /// Remove an operation without further retries and surface the failure.
    pub async fn abandon(&self, id: &str, error: &str) -> Option<SyncOperation> {
        let (op, pending) = {
            let mut queue = self.queue.lock().await;
            let op = queue.abandon(id, error)?;
            self.persist(&queue).await;
            (op, queue.len())
        };
        self.cancel_retry_timer(id);
        self.surface_abandoned(&op, error, pending).await;
        Some(op)
    }

    async fn surface_abandoned(&self, op: &SyncOperation, error: &str, pending: usize) {
        tracing::error!(
            op_id = %op.id,
            attempts = op.attempts,
            error,
            "Abandoned {}",
            op.describe()
        );
        let message = format!("{}: {}", op.describe(), error);
        self.status.update(|s| s.record_abandoned(message, pending)).await;
    }

    /// Remember the timer that will retry `id`, replacing any older one.
    pub fn track_retry_timer(&self, id: &str, timer: AbortHandle) {
        if let Some(previous) = self.retry_timers.insert(id.to_string(), timer) {
            previous.abort();
        }
    }

    /// Abort the retry timer of an operation, if any.
    pub fn cancel_retry_timer(&self, id: &str) {
        if let Some((_, timer)) = self.retry_timers.remove(id) {
            timer.abort();
            tracing::debug!(op_id = %id, "Cancelled retry timer");
        }
    }

    /// Called by a retry timer as it fires, so completing the operation
    /// does not abort the task doing the work.
    pub fn forget_retry_timer(&self, id: &str) {
        self.retry_timers.remove(id);
    }

    /// Abort every retry timer.
    pub fn cancel_all_retry_timers(&self) {
        self.retry_timers.retain(|_, timer| {
            timer.abort();
            false
        });
    }

    /// Number of live retry timers.
    pub fn retry_timer_count(&self) -> usize {
        self.retry_timers.len()
    }

    /// Allow or suppress the immediate drain trigger for HIGH priority
    /// enqueues. Operations queued while disarmed wait for the next drain.
    pub fn arm_high_priority(&self, armed: bool) {
        self.high_priority_armed.store(armed, Ordering::SeqCst);
    }

    /// Resolves after a HIGH priority operation was enqueued while armed.
    pub async fn high_priority_enqueued(&self) {
        self.high_priority.notified().await
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// A copy of every pending operation in drain order.
    pub async fn operations(&self) -> Vec<SyncOperation> {
        self.queue.lock().await.operations().to_vec()
    }

    /// Earliest scheduled retry that is not due yet.
    pub async fn next_retry_at(&self) -> Option<Timestamp> {
        let now = self.clock.now();
        self.queue.lock().await.next_retry_at(now)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn persist(&self, queue: &SyncOperationQueue) {
        let result = match queue.snapshot().to_json() {
            Ok(json) => self.state.save(keys::QUEUE, &json).await,
            Err(e) => Err(StateError::from(e)),
        };
        if let Err(e) = result {
            // The in-memory queue stays authoritative; the next mutation retries the write.
            tracing::warn!(error = %e, "Failed to persist sync queue");
            let message = format!("failed to persist sync queue: {e}");
            self.status.update(|s| s.push_error(message)).await;
        }
    }
}
