//! Queued mutation intents.
//!
//! A [`SyncOperation`] is what the queue stores: the intent to create,
//! update or delete one record remotely (or to download everything), plus
//! the bookkeeping needed to retry it.

use crate::{error::Result, EntityType, Error, Origin, Record, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Unique identifier for an operation.
pub type OperationId = String;

/// What the operation does remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    DownloadAll,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::DownloadAll => "DOWNLOAD_ALL",
        };
        f.write_str(name)
    }
}

/// Drain priority. Only affects ordering, never correctness.
///
/// Variants are declared highest first so the derived `Ord` sorts `High`
/// before `Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Identity used to collapse duplicate pending mutations.
///
/// Two operations with the same identity describe the same logical
/// mutation; the newer one supersedes the older.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationIdentity {
    pub entity_type: EntityType,
    pub kind: OperationKind,
    pub record_id: Option<RecordId>,
}

impl OperationIdentity {
    /// Whether a newly enqueued operation with this identity replaces a
    /// pending one with `older`.
    ///
    /// Identical identities always collapse. A `DELETE` also replaces any
    /// pending `CREATE` or `UPDATE` of the same record, so a queued write can
    /// never land after the record is gone.
    pub fn supersedes(&self, older: &OperationIdentity) -> bool {
        if self == older {
            return true;
        }
        self.kind == OperationKind::Delete
            && matches!(older.kind, OperationKind::Create | OperationKind::Update)
            && self.entity_type == older.entity_type
            && self.record_id.is_some()
            && self.record_id == older.record_id
    }
}

/// A queued mutation intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation ID
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    /// Snapshot of the record at enqueue time. `None` only for `DOWNLOAD_ALL`.
    pub payload: Option<Record>,
    /// When the operation was enqueued
    pub enqueued_at: Timestamp,
    /// Monotonic tie-breaker for operations enqueued in the same millisecond
    #[serde(default)]
    pub sequence: u64,
    /// Executed attempts so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: Priority,
    pub origin: Origin,
    /// Earliest time the next attempt may run (set by backoff)
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    /// Last failure message, if any
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Create a new operation.
    ///
    /// `payload` is copied into the operation, so later edits to the caller's
    /// record cannot leak into an in-flight mutation. The payload's entity
    /// type must match `entity_type`.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        entity_type: EntityType,
        payload: Option<&Record>,
        priority: Priority,
        enqueued_at: Timestamp,
        max_attempts: u32,
    ) -> Result<Self> {
        match (kind, payload) {
            (OperationKind::DownloadAll, _) => {}
            (_, None) => return Err(Error::MissingPayload(kind)),
            (_, Some(record)) if record.entity_type() != entity_type => {
                return Err(Error::EntityMismatch {
                    expected: entity_type,
                    actual: record.entity_type(),
                })
            }
            (_, Some(_)) => {}
        }
        let (entity_type, payload) = if kind == OperationKind::DownloadAll {
            (EntityType::All, None)
        } else {
            (entity_type, payload.cloned())
        };

        Ok(Self {
            id: id.into(),
            kind,
            entity_type,
            payload,
            enqueued_at,
            sequence: 0,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            priority,
            origin: Origin::Local,
            next_attempt_at: None,
            last_error: None,
        })
    }

    /// Create a `DOWNLOAD_ALL` operation.
    pub fn download_all(
        id: impl Into<OperationId>,
        priority: Priority,
        enqueued_at: Timestamp,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            kind: OperationKind::DownloadAll,
            entity_type: EntityType::All,
            payload: None,
            enqueued_at,
            sequence: 0,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            priority,
            origin: Origin::Local,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Set the provenance.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Id of the record this operation targets.
    pub fn record_id(&self) -> Option<&RecordId> {
        self.payload.as_ref().map(Record::id)
    }

    /// The supersession identity of this operation.
    pub fn identity(&self) -> OperationIdentity {
        OperationIdentity {
            entity_type: self.entity_type,
            kind: self.kind,
            record_id: self.record_id().cloned(),
        }
    }

    /// Whether the operation may run at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Drain order: priority, then oldest first, then enqueue sequence.
    pub fn drain_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.enqueued_at.cmp(&other.enqueued_at))
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Short human-readable description used in logs and status errors.
    pub fn describe(&self) -> String {
        match self.record_id() {
            Some(id) => format!("{} {} {}", self.kind, self.entity_type, id),
            None => format!("{} {}", self.kind, self.entity_type),
        }
    }
}
