//! Snapshot types for persisting and restoring engine state.
//!
//! Snapshots are the bridge between the in-memory queue and lifecycle state
//! and durable storage. They serialize deterministically (ordered
//! collections only) and carry a format version so older builds refuse data
//! they do not understand.

use crate::{error::Result, Error, GroupId, SyncOperation};
use crate::lifecycle::Selection;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// The pending-operation queue at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Pending operations in drain order
    pub operations: Vec<SyncOperation>,
}

impl QueueSnapshot {
    /// Create a snapshot of the given operations.
    pub fn new(operations: Vec<SyncOperation>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            operations,
        }
    }

    /// Number of operations captured.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the snapshot holds no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        to_json(self)
    }

    /// Deserialize from JSON, rejecting newer formats.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = from_json(json)?;
        check_version(snapshot.format_version)?;
        Ok(snapshot)
    }
}

/// Tombstones, hidden groups and the current selection for one user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Permanently deleted groups
    pub tombstones: BTreeSet<GroupId>,
    /// Groups the user explicitly hid
    #[serde(default)]
    pub hidden: BTreeSet<GroupId>,
    #[serde(default)]
    pub selection: Selection,
}

impl LifecycleSnapshot {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        to_json(self)
    }

    /// Deserialize from JSON, rejecting newer formats.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = from_json(json)?;
        check_version(snapshot.format_version)?;
        Ok(snapshot)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::InvalidSnapshot(e.to_string()))
}

fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
}

fn check_version(actual: u32) -> Result<()> {
    if actual > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::SnapshotVersionMismatch {
            supported: SNAPSHOT_FORMAT_VERSION,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityType, OperationKind, Player, Priority, Record};

    fn op(id: &str) -> SyncOperation {
        let record = Record::Player(Player {
            id: format!("p-{id}"),
            group_id: "g-1".into(),
            name: "Ada".into(),
            nickname: None,
            active: true,
            last_modified: 1,
        });
        SyncOperation::new(
            id,
            OperationKind::Create,
            EntityType::Player,
            Some(&record),
            Priority::Normal,
            1,
            5,
        )
        .unwrap()
    }

    #[test]
    fn queue_snapshot_json_roundtrip() {
        let snapshot = QueueSnapshot::new(vec![op("a"), op("b")]);
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"formatVersion\":1"));

        let parsed = QueueSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn rejects_future_format() {
        let json = r#"{"formatVersion": 99, "operations": []}"#;
        let err = QueueSnapshot::from_json(json).unwrap_err();
        assert_eq!(
            err,
            Error::SnapshotVersionMismatch {
                supported: SNAPSHOT_FORMAT_VERSION,
                actual: 99
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            QueueSnapshot::from_json("not json"),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn lifecycle_snapshot_defaults_missing_fields() {
        let json = r#"{"formatVersion": 1, "tombstones": ["g-2", "g-1"]}"#;
        let snapshot = LifecycleSnapshot::from_json(json).unwrap();
        assert_eq!(snapshot.tombstones.len(), 2);
        assert!(snapshot.hidden.is_empty());
        assert_eq!(snapshot.selection, Selection::default());
    }

    #[test]
    fn lifecycle_snapshot_is_deterministic() {
        let mut a = LifecycleSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            ..Default::default()
        };
        a.tombstones.insert("g-2".into());
        a.tombstones.insert("g-1".into());

        let mut b = a.clone();
        b.tombstones.clear();
        b.tombstones.insert("g-1".into());
        b.tombstones.insert("g-2".into());

        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }
}
