//! Unified error handling for the sync runtime.

use thiserror::Error;

/// Failures reported by a remote store, classified where they are produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Remote call timed out")]
    Timeout,

    #[error("Remote quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Internal remote error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Storage or capacity exhaustion, which gets the cache-clear recovery path.
    pub fn is_quota(&self) -> bool {
        matches!(self, RemoteError::QuotaExceeded(_))
    }

    /// Failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unavailable(_) | RemoteError::Timeout | RemoteError::Internal(_)
        )
    }
}

/// Failures reported by the local store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocalStoreError {
    #[error("Local store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid record: {0}")]
    Invalid(#[from] squad_engine::Error),
}

/// Failures of the durable state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] squad_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Application-facing error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Local store error: {0}")]
    Local(#[from] LocalStoreError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Validation failures; surfaced immediately, never retried.
    #[error(transparent)]
    Engine(#[from] squad_engine::Error),

    #[error("Auto sync is disabled")]
    Disabled,

    #[error("Device is offline")]
    Offline,

    #[error("No user is signed in")]
    NotSignedIn,
}

impl SyncError {
    /// Collapse into a remote error for operations that run inside the queue.
    pub fn into_remote(self) -> RemoteError {
        match self {
            SyncError::Remote(e) => e,
            SyncError::Offline => RemoteError::Unavailable("device is offline".into()),
            other => RemoteError::Internal(other.to_string()),
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(RemoteError::QuotaExceeded("disk".into()).is_quota());
        assert!(!RemoteError::QuotaExceeded("disk".into()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Unavailable("offline".into()).is_transient());
        assert!(!RemoteError::PermissionDenied("rules".into()).is_transient());
    }

    #[test]
    fn validation_errors_display_verbatim() {
        let err = SyncError::from(squad_engine::Error::GroupDeleted("g-1".into()));
        assert_eq!(err.to_string(), "group has been deleted: g-1");
    }

    #[test]
    fn into_remote_keeps_remote_errors() {
        let err = SyncError::Remote(RemoteError::Timeout);
        assert_eq!(err.into_remote(), RemoteError::Timeout);
        assert!(matches!(
            SyncError::NotSignedIn.into_remote(),
            RemoteError::Internal(_)
        ));
    }
}
