//! Conflict resolution between a local record and its incoming remote value.
//!
//! # Algorithm
//!
//! 1. If only one side exists, it wins.
//! 2. If both `last_modified` timestamps fall inside the recency window,
//!    the local side wins (it is what the user is looking at) and the result
//!    is re-stamped with "now" and reported as [`ConflictResolution::Merged`].
//! 3. Otherwise the strictly newer side wins verbatim: whole-record
//!    last-writer-wins, no field-level merge.
//!
//! The resolver is pure. "Now" is passed in and only ever used as the new
//! timestamp of a merged result; the decision itself depends on the two
//! input timestamps alone.

use crate::{Record, Timestamp};
use serde::{Deserialize, Serialize};

/// Default recency window in milliseconds.
pub const DEFAULT_RECENCY_WINDOW_MS: u64 = 5_000;

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Only a local record existed
    LocalOnly,
    /// Only a remote record existed
    RemoteOnly,
    /// Local was strictly newer
    LocalWins,
    /// Remote was strictly newer
    RemoteWins,
    /// Timestamps were concurrent; local fields kept with a fresh timestamp
    Merged,
}

impl ConflictResolution {
    /// Whether the local fields survived.
    pub fn keeps_local(self) -> bool {
        matches!(
            self,
            ConflictResolution::LocalOnly
                | ConflictResolution::LocalWins
                | ConflictResolution::Merged
        )
    }
}

/// The outcome of resolving one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// The winning value, to be written locally
    pub record: Record,
    /// How it was chosen
    pub resolution: ConflictResolution,
}

/// Whole-record last-writer-wins with a local bias for concurrent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictResolver {
    window_ms: u64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_WINDOW_MS)
    }
}

impl ConflictResolver {
    /// Create a resolver with the given recency window.
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms }
    }

    /// The recency window in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Whether two timestamps count as concurrent.
    pub fn within_window(&self, a: Timestamp, b: Timestamp) -> bool {
        a.abs_diff(b) < self.window_ms
    }

    /// Resolve a local record against an incoming remote one.
    ///
    /// Both records, when present, must describe the same entity. Returns
    /// `None` only when neither side exists.
    pub fn resolve(
        &self,
        local: Option<&Record>,
        remote: Option<&Record>,
        now: Timestamp,
    ) -> Option<Resolved> {
        let (local, remote) = match (local, remote) {
            (None, None) => return None,
            (Some(local), None) => {
                return Some(Resolved {
                    record: local.clone(),
                    resolution: ConflictResolution::LocalOnly,
                })
            }
            (None, Some(remote)) => {
                return Some(Resolved {
                    record: remote.clone(),
                    resolution: ConflictResolution::RemoteOnly,
                })
            }
            (Some(local), Some(remote)) => (local, remote),
        };
        debug_assert_eq!(local.id(), remote.id());

        let local_ts = local.last_modified();
        let remote_ts = remote.last_modified();

        if self.within_window(local_ts, remote_ts) {
            // Never move a record's timestamp backwards, even with a skewed clock.
            let stamp = now.max(local_ts).max(remote_ts);
            return Some(Resolved {
                record: local.clone().with_last_modified(stamp),
                resolution: ConflictResolution::Merged,
            });
        }

        if local_ts > remote_ts {
            Some(Resolved {
                record: local.clone(),
                resolution: ConflictResolution::LocalWins,
            })
        } else {
            Some(Resolved {
                record: remote.clone(),
                resolution: ConflictResolution::RemoteWins,
            })
        }
    }
}
