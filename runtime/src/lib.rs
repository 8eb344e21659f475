//! # Squad Runtime
//!
//! Async services that drive [`squad_engine`] on tokio: the durable
//! operation queue, the [`SyncEngine`] with its drain and reconciliation
//! timers, the [`RealtimeReplicator`] and the [`GroupLifecycleManager`].
//!
//! The host application plugs in its local store, remote document store and
//! auth session through the traits in [`store`]. Durable sync state (queue,
//! status, device id, per-user group lifecycle) goes through a
//! [`StateStore`], backed by SQLite in production.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use squad_runtime::{
//!     MemoryBackend, MemoryLocalStore, SqliteStateStore, StaticSession, SyncConfig, SyncEngine,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::from_env()?;
//! let state = Arc::new(SqliteStateStore::connect(&config.database_url).await?);
//! let backend = MemoryBackend::new();
//!
//! let engine = SyncEngine::builder(
//!     MemoryLocalStore::new_shared(),
//!     backend.client(),
//!     StaticSession::signed_in("u-1"),
//!     state,
//! )
//! .config(config)
//! .build()
//! .await?;
//!
//! engine.enable_auto_sync().await;
//! println!("pending: {}", engine.sync_status().pending_operations);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod db;
pub mod device;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod listeners;
pub mod memory;
pub mod queue;
pub mod replicator;
pub mod status;
pub mod store;

pub use clock::MonotonicClock;
pub use config::{ConfigError, SyncConfig};
pub use db::{MemoryStateStore, SqliteStateStore, StateStore};
pub use device::load_or_create_device_id;
pub use engine::{DownloadReport, DrainReport, SkipReason, SyncEngine, SyncEngineBuilder};
pub use error::{LocalStoreError, RemoteError, Result, StateError, SyncError};
pub use lifecycle::{AuditReport, CascadeReport, GroupLifecycleManager};
pub use listeners::{ListenerRegistry, Subscription};
pub use memory::{MemoryBackend, MemoryLocalStore, MemoryRemote, StaticSession};
pub use queue::QueueService;
pub use replicator::{
    ApplyOutcome, ChangeNotification, RealtimeReplicator, RealtimeUpdate, ReplicatorSettings,
    ReplicatorStats, NOTIFICATIONS_COLLECTION,
};
pub use status::StatusTracker;
pub use store::{
    AuthSession, ChangeKind, ChangeStream, Direction, DocumentChange, Filter, LocalStore, Query,
    RemoteStore,
};
