//! # Squad Engine
//!
//! The deterministic core of Squad's offline-first sync.
//!
//! This crate holds the state machines that decide *what* should happen when
//! devices edit the same users, groups, players and matches while offline.
//! It never performs I/O and never reads the clock: callers pass "now" in,
//! so the same inputs always produce the same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, network or timers; persistence goes through snapshots
//! - **Deterministic**: every timestamp is an argument
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! [`Record`] is a tagged union over the four synchronized entity kinds.
//! Each carries a `last_modified` timestamp, the only input to conflict
//! resolution.
//!
//! ### Operations and the queue
//!
//! A [`SyncOperation`] is a queued intent to create, update or delete a
//! record remotely. The [`SyncOperationQueue`] keeps at most one pending
//! operation per logical mutation, orders them by priority then age, and
//! tracks retry backoff.
//!
//! ### Conflict resolution
//!
//! The [`ConflictResolver`] is whole-record last-writer-wins, except that
//! edits within a short recency window of each other keep the local side.
//!
//! ### Group lifecycle
//!
//! [`GroupLifecycle`] owns the current-group selection lock, the hidden set
//! and the permanent tombstone set.
//!
//! ## Quick Start
//!
//! ```rust
//! use squad_engine::{
//!     ConflictResolution, ConflictResolver, EntityType, Match, OperationKind, Priority,
//!     Record, SyncOperation, SyncOperationQueue,
//! };
//!
//! let local = Record::Match(Match {
//!     id: "m1".into(),
//!     group_id: "g-1".into(),
//!     played_at: 0,
//!     team_a: vec!["p-1".into()],
//!     team_b: vec!["p-2".into()],
//!     score_a: Some(3),
//!     score_b: Some(1),
//!     last_modified: 1_000,
//! });
//!
//! // 1. Queue the local edit
//! let mut queue = SyncOperationQueue::new();
//! let op = SyncOperation::new(
//!     "op-1",
//!     OperationKind::Update,
//!     EntityType::Match,
//!     Some(&local),
//!     Priority::Normal,
//!     1_000,
//!     5,
//! )
//! .unwrap();
//! queue.enqueue(op);
//! assert_eq!(queue.dequeue_batch(5, 1_000).len(), 1);
//!
//! // 2. A concurrent remote edit arrives 50ms later
//! let remote = local.clone().with_last_modified(1_050);
//! let resolved = ConflictResolver::default()
//!     .resolve(Some(&local), Some(&remote), 2_000)
//!     .unwrap();
//! assert_eq!(resolved.resolution, ConflictResolution::Merged);
//! assert_eq!(resolved.record.last_modified(), 2_000);
//! ```
//!
//! ## Persistence
//!
//! [`SyncOperationQueue::snapshot`] and [`GroupLifecycle::snapshot`] export
//! versioned JSON envelopes ([`QueueSnapshot`], [`LifecycleSnapshot`]) with
//! deterministic ordering. Writing them somewhere durable is the runtime's job.

pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod operation;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod status;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock};
pub use error::{Error, Result};
pub use lifecycle::{DeletionOutcome, GroupLifecycle, Selection, SelectionChange};
pub use operation::{OperationId, OperationIdentity, OperationKind, Priority, SyncOperation};
pub use queue::{EnqueueOutcome, FailureOutcome, RetryPolicy, SyncOperationQueue};
pub use reconcile::{ConflictResolution, ConflictResolver, Resolved, DEFAULT_RECENCY_WINDOW_MS};
pub use record::{normalize_invite_code, EntityType, Group, Match, Origin, Player, Record, User};
pub use snapshot::{LifecycleSnapshot, QueueSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use status::{SyncStatus, MAX_STATUS_ERRORS};

/// Type aliases for clarity
pub type RecordId = String;
pub type UserId = String;
pub type GroupId = String;
pub type DeviceId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
