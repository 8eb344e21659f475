//! The observable sync status aggregate.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Maximum number of error strings kept; the oldest are dropped first.
pub const MAX_STATUS_ERRORS: usize = 50;

/// Process-wide sync health as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStatus {
    pub enabled: bool,
    pub online: bool,
    /// Last time a drain or download finished without failures
    pub last_sync_time: Option<Timestamp>,
    pub pending_operations: usize,
    /// Operations ever enqueued
    pub total_operations: u64,
    /// Operations that left the queue, succeeded or abandoned
    pub completed_operations: u64,
    /// `completed / total` as 0..=100
    pub sync_progress: u8,
    /// Abandoned operations and other surfaced failures, oldest first
    pub errors: Vec<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub background_sync_in_progress: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            enabled: false,
            online: false,
            last_sync_time: None,
            pending_operations: 0,
            total_operations: 0,
            completed_operations: 0,
            sync_progress: 100,
            errors: Vec::new(),
            last_error: None,
            consecutive_failures: 0,
            background_sync_in_progress: false,
        }
    }
}

impl SyncStatus {
    /// A fresh status.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new operation entered the queue.
    pub fn record_enqueued(&mut self, pending: usize) {
        self.total_operations += 1;
        self.pending_operations = pending;
        self.refresh_progress();
    }

    /// Operations left the queue without being executed (superseded).
    pub fn record_dropped(&mut self, count: usize, pending: usize) {
        self.completed_operations += count as u64;
        self.pending_operations = pending;
        self.refresh_progress();
    }

    /// An operation reached the remote.
    pub fn record_success(&mut self, pending: usize) {
        self.completed_operations += 1;
        self.consecutive_failures = 0;
        self.pending_operations = pending;
        self.refresh_progress();
    }

    /// An attempt failed but the operation stays queued for a retry.
    pub fn record_retry(&mut self, error: impl Into<String>, pending: usize) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.pending_operations = pending;
    }

    /// An operation was given up on. It is surfaced in `errors` exactly once.
    pub fn record_abandoned(&mut self, error: impl Into<String>, pending: usize) {
        let error = error.into();
        self.consecutive_failures += 1;
        self.completed_operations += 1;
        self.pending_operations = pending;
        self.push_error(error);
        self.refresh_progress();
    }

    /// Surface a failure that is not tied to a queued operation.
    pub fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        if self.errors.len() >= MAX_STATUS_ERRORS {
            let excess = self.errors.len() + 1 - MAX_STATUS_ERRORS;
            self.errors.drain(..excess);
        }
        self.last_error = Some(error.clone());
        self.errors.push(error);
    }

    /// A drain or download finished cleanly.
    pub fn mark_synced(&mut self, now: Timestamp) {
        self.last_sync_time = Some(now);
    }

    /// Drop surfaced errors, e.g. after the user acknowledged them.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
        self.last_error = None;
    }

    /// Reset the transient flags after loading a persisted status.
    ///
    /// Online state, the enabled flag and background activity describe the
    /// previous process, not this one.
    pub fn reset_transient(&mut self) {
        self.online = false;
        self.enabled = false;
        self.background_sync_in_progress = false;
    }

    fn refresh_progress(&mut self) {
        self.sync_progress = if self.total_operations == 0 {
            100
        } else {
            let done = self.completed_operations.min(self.total_operations);
            (done * 100 / self.total_operations) as u8
        };
    }
}
