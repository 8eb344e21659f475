//! Error types for the Squad sync engine.

use crate::{EntityType, GroupId, OperationKind, RecordId};
use thiserror::Error;

/// All validation and state errors raised by the engine.
///
/// These never cross a retry boundary: a caller that receives one of them
/// should surface it immediately instead of queueing the work again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Group lifecycle
    #[error("group has been deleted: {0}")]
    GroupDeleted(GroupId),

    #[error("emergency undelete of group {0} requires explicit confirmation")]
    UndeleteNotConfirmed(GroupId),

    #[error("group is not deleted: {0}")]
    GroupNotDeleted(GroupId),

    // Record validation
    #[error("invalid invite code: {0:?}")]
    InvalidInviteCode(String),

    #[error("invite code {code} is already used by group {group_id}")]
    DuplicateInviteCode { code: String, group_id: GroupId },

    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: RecordId, reason: String },

    #[error("entity type mismatch: expected {expected}, got {actual}")]
    EntityMismatch {
        expected: EntityType,
        actual: EntityType,
    },

    #[error("{0} operation requires a payload")]
    MissingPayload(OperationKind),

    // Persisted state
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("unsupported snapshot format version {actual} (max supported: {supported})")]
    SnapshotVersionMismatch { supported: u32, actual: u32 },
}

impl Error {
    /// Shorthand for [`Error::InvalidRecord`].
    pub fn invalid_record(id: impl Into<RecordId>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::GroupDeleted("g-1".into());
        assert_eq!(err.to_string(), "group has been deleted: g-1");

        let err = Error::EntityMismatch {
            expected: EntityType::Group,
            actual: EntityType::Player,
        };
        assert_eq!(
            err.to_string(),
            "entity type mismatch: expected GROUP, got PLAYER"
        );

        let err = Error::MissingPayload(OperationKind::Update);
        assert_eq!(err.to_string(), "UPDATE operation requires a payload");

        let err = Error::SnapshotVersionMismatch {
            supported: 1,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "unsupported snapshot format version 3 (max supported: 1)"
        );
    }
}
