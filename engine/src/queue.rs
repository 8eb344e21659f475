//! The pending-operation queue.
//!
//! This is the in-memory half of the durable queue: ordering, supersession
//! and retry bookkeeping. Persisting it after every mutation is the caller's
//! job (see [`SyncOperationQueue::snapshot`]); the queue itself does no I/O.

use crate::{
    snapshot::QueueSnapshot, OperationId, OperationIdentity, SyncOperation, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Retry ceiling and the fixed backoff table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts after which an operation is abandoned
    pub max_attempts: u32,
    /// Delay before the n-th retry, in milliseconds, longest last
    pub delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delays_ms: vec![1_000, 2_000, 5_000, 10_000, 30_000],
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after an operation has failed `attempts` times.
    ///
    /// Attempts beyond the table reuse its last (longest) entry.
    pub fn delay_after(&self, attempts: u32) -> u64 {
        let index = attempts.saturating_sub(1) as usize;
        self.delays_ms
            .get(index)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Result of [`SyncOperationQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Id of the newly queued operation
    pub id: OperationId,
    /// Older pending operations for the same logical mutation, now removed
    pub superseded: Vec<SyncOperation>,
}

/// What happened to an operation after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still queued; may run again at `next_attempt_at`
    Retry {
        id: OperationId,
        attempts: u32,
        next_attempt_at: Timestamp,
    },
    /// Retry budget spent; removed from the queue
    Abandoned(SyncOperation),
}

/// Priority-ordered list of pending operations.
///
/// Invariant: at most one pending operation per [`OperationIdentity`], and
/// `operations` is always sorted in drain order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOperationQueue {
    operations: Vec<SyncOperation>,
    next_sequence: u64,
}

impl SyncOperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted operations.
    ///
    /// Duplicate identities are collapsed, keeping the most recently enqueued.
    pub fn from_operations(operations: Vec<SyncOperation>) -> Self {
        let mut queue = Self::new();
        let mut operations = operations;
        operations.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        for op in operations {
            queue.next_sequence = queue.next_sequence.max(op.sequence + 1);
            let identity = op.identity();
            queue.operations.retain(|o| !identity.supersedes(&o.identity()));
            queue.operations.push(op);
        }
        queue.sort();
        queue
    }

    /// Add an operation, superseding any pending one it replaces.
    ///
    /// See [`OperationIdentity::supersedes`].
    pub fn enqueue(&mut self, mut op: SyncOperation) -> EnqueueOutcome {
        op.sequence = self.next_sequence;
        self.next_sequence += 1;

        let identity = op.identity();
        let superseded = self.take_superseded(&identity);

        let id = op.id.clone();
        self.operations.push(op);
        self.sort();

        EnqueueOutcome { id, superseded }
    }

    /// Up to `limit` due operations in drain order, without removing them.
    pub fn dequeue_batch(&self, limit: usize, now: Timestamp) -> Vec<SyncOperation> {
        self.operations
            .iter()
            .filter(|op| op.is_due(now))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove operations by id, returning the ones that were present.
    pub fn remove(&mut self, ids: &[OperationId]) -> Vec<SyncOperation> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.operations)
            .into_iter()
            .partition(|op| ids.contains(&op.id));
        self.operations = kept;
        removed
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// Returns `None` if the operation is no longer queued (for example
    /// because it was superseded while in flight).
    pub fn record_failure(
        &mut self,
        id: &str,
        error: &str,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Option<FailureOutcome> {
        let index = self.operations.iter().position(|op| op.id == id)?;
        let op = &mut self.operations[index];
        op.attempts += 1;
        op.last_error = Some(error.to_string());

        if op.is_exhausted() {
            let op = self.operations.remove(index);
            return Some(FailureOutcome::Abandoned(op));
        }

        let next_attempt_at = now + policy.delay_after(op.attempts);
        op.next_attempt_at = Some(next_attempt_at);
        Some(FailureOutcome::Retry {
            id: op.id.clone(),
            attempts: op.attempts,
            next_attempt_at,
        })
    }

    /// Remove an operation immediately, counting the failed attempt.
    pub fn abandon(&mut self, id: &str, error: &str) -> Option<SyncOperation> {
        let index = self.operations.iter().position(|op| op.id == id)?;
        let mut op = self.operations.remove(index);
        op.attempts += 1;
        op.last_error = Some(error.to_string());
        Some(op)
    }

    /// Get a pending operation by id.
    pub fn get(&self, id: &str) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// The pending operation for a logical mutation, if any.
    pub fn find(&self, identity: &OperationIdentity) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| &op.identity() == identity)
    }

    /// All pending operations in drain order.
    pub fn operations(&self) -> &[SyncOperation] {
        &self.operations
    }

    /// Earliest scheduled retry among operations that are not yet due.
    pub fn next_retry_at(&self, now: Timestamp) -> Option<Timestamp> {
        self.operations
            .iter()
            .filter_map(|op| op.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Export the queue for persistence.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::new(self.operations.clone())
    }

    /// Restore a queue from a persisted snapshot.
    pub fn restore(snapshot: QueueSnapshot) -> Self {
        Self::from_operations(snapshot.operations)
    }

    fn take_superseded(&mut self, identity: &OperationIdentity) -> Vec<SyncOperation> {
        let (matching, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.operations)
            .into_iter()
            .partition(|op| identity.supersedes(&op.identity()));
        self.operations = kept;
        matching
    }

    fn sort(&mut self) {
        self.operations.sort_by(|a, b| a.drain_order(b));
    }
}
