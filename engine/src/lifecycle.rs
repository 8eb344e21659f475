//! Group selection, visibility and tombstones.
//!
//! Selection is a two-state machine:
//!
//! ```text
//! Unselected --(any selection)--> Selected(locked)
//! Selected   --(user action)----> Selected(other) | Unselected
//! Selected   --(group gone)-----> Selected(fallback) | Unselected
//! ```
//!
//! Once a group is selected, automatic reassignment is refused. Only a
//! user-initiated call may replace or clear it, except when the selected
//! group disappears or is deleted, in which case the lifecycle falls back on
//! its own. Tombstoned groups never become selectable or visible again
//! through normal operation.

use crate::{error::Result, snapshot::LifecycleSnapshot, Error, Group, GroupId, Timestamp};
use crate::snapshot::SNAPSHOT_FORMAT_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The current-group selection state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Selection {
    #[default]
    Unselected,
    #[serde(rename_all = "camelCase")]
    Selected {
        group_id: GroupId,
        /// Whether the latest selection came from the user
        user_initiated: bool,
        selected_at: Timestamp,
    },
}

impl Selection {
    /// The selected group id, if any.
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Selection::Unselected => None,
            Selection::Selected { group_id, .. } => Some(group_id),
        }
    }

    /// Whether automatic reassignment is currently refused.
    pub fn is_locked(&self) -> bool {
        matches!(self, Selection::Selected { .. })
    }
}

/// What a selection call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionChange {
    /// The group is now selected
    Selected(GroupId),
    /// The requested group was already selected
    Unchanged,
    /// An automatic change was refused because the selection is locked
    Rejected { current: GroupId },
    /// The selection was cleared
    Cleared,
    /// The previous selection vanished and the lifecycle picked a replacement
    FellBack {
        from: Option<GroupId>,
        to: Option<GroupId>,
    },
}

/// Result of tombstoning a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionOutcome {
    /// False if the group was already tombstoned
    pub newly_tombstoned: bool,
    /// True if the deleted group was the current selection
    pub cleared_selection: bool,
}

/// Per-user group lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupLifecycle {
    tombstones: BTreeSet<GroupId>,
    hidden: BTreeSet<GroupId>,
    selection: Selection,
}

impl GroupLifecycle {
    /// Create an empty lifecycle: nothing selected, nothing deleted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a group.
    ///
    /// Selecting a tombstoned group fails. Automatic (non user-initiated)
    /// selection only succeeds when nothing is selected yet.
    pub fn set_current_group(
        &mut self,
        group: &Group,
        user_initiated: bool,
        now: Timestamp,
    ) -> Result<SelectionChange> {
        if self.is_tombstoned(&group.id) {
            return Err(Error::GroupDeleted(group.id.clone()));
        }

        match &mut self.selection {
            Selection::Selected {
                group_id,
                user_initiated: by_user,
                ..
            } if *group_id == group.id => {
                *by_user |= user_initiated;
                return Ok(SelectionChange::Unchanged);
            }
            Selection::Selected { group_id, .. } if !user_initiated => {
                return Ok(SelectionChange::Rejected {
                    current: group_id.clone(),
                });
            }
            _ => {}
        }

        self.selection = Selection::Selected {
            group_id: group.id.clone(),
            user_initiated,
            selected_at: now,
        };
        Ok(SelectionChange::Selected(group.id.clone()))
    }

    /// Clear the selection. Only the user may unlock it.
    pub fn clear_selection(&mut self, user_initiated: bool) -> SelectionChange {
        match &self.selection {
            Selection::Unselected => SelectionChange::Unchanged,
            Selection::Selected { group_id, .. } if !user_initiated => SelectionChange::Rejected {
                current: group_id.clone(),
            },
            Selection::Selected { .. } => {
                self.selection = Selection::Unselected;
                SelectionChange::Cleared
            }
        }
    }

    /// The current group among `available`, selecting one if needed.
    ///
    /// If nothing is selected, or the selected group is no longer available
    /// or has been tombstoned, the candidate with the lowest id is selected
    /// automatically (or the selection is cleared when none remain).
    pub fn current_group<'a>(
        &mut self,
        available: &'a [Group],
        now: Timestamp,
    ) -> (Option<&'a Group>, SelectionChange) {
        if let Some(selected) = self.selection.group_id() {
            if !self.is_tombstoned(selected) {
                if let Some(group) = available.iter().find(|g| &g.id == selected) {
                    return (Some(group), SelectionChange::Unchanged);
                }
            }
        }

        let previous = self.selection.group_id().cloned();
        let fallback = available
            .iter()
            .filter(|g| !self.is_tombstoned(&g.id))
            .min_by(|a, b| a.id.cmp(&b.id));

        self.selection = match fallback {
            Some(group) => Selection::Selected {
                group_id: group.id.clone(),
                user_initiated: false,
                selected_at: now,
            },
            None => Selection::Unselected,
        };

        let to = fallback.map(|g| g.id.clone());
        let change = match (&previous, &to) {
            (None, None) => SelectionChange::Unchanged,
            (None, Some(id)) => SelectionChange::Selected(id.clone()),
            _ => SelectionChange::FellBack { from: previous, to },
        };
        (fallback, change)
    }

    /// Tombstone a group. Irreversible through normal operation.
    pub fn mark_deleted(&mut self, group_id: &str) -> DeletionOutcome {
        let newly_tombstoned = self.tombstones.insert(group_id.to_string());
        self.hidden.insert(group_id.to_string());

        let cleared_selection = self.selection.group_id().map(String::as_str) == Some(group_id);
        if cleared_selection {
            self.selection = Selection::Unselected;
        }

        DeletionOutcome {
            newly_tombstoned,
            cleared_selection,
        }
    }

    /// Remove a tombstone. Fails unless `confirmed` is explicitly true.
    pub fn emergency_undelete(&mut self, group_id: &str, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(Error::UndeleteNotConfirmed(group_id.to_string()));
        }
        if !self.tombstones.remove(group_id) {
            return Err(Error::GroupNotDeleted(group_id.to_string()));
        }
        self.hidden.remove(group_id);
        Ok(())
    }

    /// Whether the group has been deleted.
    pub fn is_tombstoned(&self, group_id: &str) -> bool {
        self.tombstones.contains(group_id)
    }

    /// False iff tombstoned or explicitly hidden.
    pub fn is_visible(&self, group_id: &str) -> bool {
        !self.is_tombstoned(group_id) && !self.hidden.contains(group_id)
    }

    /// Filter out tombstoned and hidden groups.
    pub fn visible_groups<'a>(&self, groups: &'a [Group]) -> Vec<&'a Group> {
        groups.iter().filter(|g| self.is_visible(&g.id)).collect()
    }

    /// Hide a group without deleting it. Returns false if already hidden.
    pub fn hide(&mut self, group_id: &str) -> bool {
        self.hidden.insert(group_id.to_string())
    }

    /// Un-hide a group. Tombstoned groups stay hidden.
    pub fn show(&mut self, group_id: &str) -> Result<bool> {
        if self.is_tombstoned(group_id) {
            return Err(Error::GroupDeleted(group_id.to_string()));
        }
        Ok(self.hidden.remove(group_id))
    }

    /// All tombstoned group ids.
    pub fn tombstones(&self) -> impl Iterator<Item = &GroupId> {
        self.tombstones.iter()
    }

    /// The current selection state.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The selected group id, if any.
    pub fn current_group_id(&self) -> Option<&GroupId> {
        self.selection.group_id()
    }

    /// Export for persistence.
    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            tombstones: self.tombstones.clone(),
            hidden: self.hidden.clone(),
            selection: self.selection.clone(),
        }
    }

    /// Restore from a persisted snapshot.
    ///
    /// A persisted selection pointing at a tombstoned group is dropped.
    pub fn restore(snapshot: LifecycleSnapshot) -> Self {
        let mut lifecycle = Self {
            tombstones: snapshot.tombstones,
            hidden: snapshot.hidden,
            selection: snapshot.selection,
        };
        if let Some(id) = lifecycle.selection.group_id() {
            if lifecycle.tombstones.contains(id) {
                lifecycle.selection = Selection::Unselected;
            }
        }
        lifecycle
    }
}
