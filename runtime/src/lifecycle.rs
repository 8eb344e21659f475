//! Group lifecycle service.
//!
//! Owns the signed-in user's [`GroupLifecycle`] (selection, hidden groups,
//! tombstones), persists it on every mutation under a per-user key, and runs
//! the best-effort cascade that follows a deletion.

use crate::db::{keys, StateStore};
use crate::error::{Result, SyncError};
use crate::queue::QueueService;
use crate::store::{LocalStore, Query, RemoteStore};
use squad_engine::{
    Clock, EntityType, Group, GroupId, GroupLifecycle, LifecycleSnapshot, OperationKind, Origin,
    Priority, Record, RecordId, Selection, SelectionChange, UserId,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// What a deletion did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// False if the group was already tombstoned
    pub newly_tombstoned: bool,
    /// True if the deleted group was the current selection
    pub cleared_selection: bool,
    /// Local records removed (the group and its players and matches)
    pub local_deleted: usize,
    /// Remote deletes queued
    pub remote_deletes_queued: usize,
    /// Steps that failed and were skipped
    pub failures: usize,
}

/// What a consistency audit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub purged_groups: usize,
    pub purged_records: usize,
    pub selection: SelectionChange,
}

struct Session {
    user_id: Option<UserId>,
    lifecycle: GroupLifecycle,
}

impl Session {
    fn user(&self) -> Result<&UserId> {
        self.user_id.as_ref().ok_or(SyncError::NotSignedIn)
    }
}

/// Selection, visibility and deletion for the signed-in user.
pub struct GroupLifecycleManager {
    state: Arc<dyn StateStore>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    queue: Arc<QueueService>,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
    selection_tx: watch::Sender<Option<GroupId>>,
}

impl GroupLifecycleManager {
    pub fn new(
        state: Arc<dyn StateStore>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        queue: Arc<QueueService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (selection_tx, _) = watch::channel(None);
        Self {
            state,
            local,
            remote,
            queue,
            clock,
            session: Mutex::new(Session {
                user_id: None,
                lifecycle: GroupLifecycle::new(),
            }),
            selection_tx,
        }
    }

    /// Switch to `user_id`'s lifecycle, or drop all state on sign-out.
    pub async fn activate_user(&self, user_id: Option<UserId>) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.user_id == user_id {
            return Ok(());
        }

        let lifecycle = match &user_id {
            Some(user) => match self.state.load(&keys::lifecycle(user)).await? {
                Some(json) => {
                    GroupLifecycle::restore(LifecycleSnapshot::from_json(&json).map_err(|e| {
                        SyncError::State(e.into())
                    })?)
                }
                None => GroupLifecycle::new(),
            },
            None => GroupLifecycle::new(),
        };

        match &user_id {
            Some(user) => tracing::info!(
                user_id = %user,
                tombstones = lifecycle.tombstones().count(),
                "Group lifecycle restored"
            ),
            None => tracing::info!("Signed out; group lifecycle cleared"),
        }
        session.user_id = user_id;
        session.lifecycle = lifecycle;
        self.publish(&session);
        Ok(())
    }

    pub async fn current_user(&self) -> Option<UserId> {
        self.session.lock().await.user_id.clone()
    }

    /// Select a group.
    ///
    /// Fails with [`squad_engine::Error::GroupDeleted`] for tombstoned
    /// groups. Automatic calls are refused once a group is selected.
    pub async fn set_current_group(&self, group: &Group, user_initiated: bool) -> Result<SelectionChange> {
        let mut session = self.session.lock().await;
        session.user()?;
        let change = session
            .lifecycle
            .set_current_group(group, user_initiated, self.clock.now())?;

        match &change {
            SelectionChange::Rejected { current } => {
                tracing::warn!(
                    requested = %group.id,
                    current = %current,
                    "Refused automatic group reassignment"
                );
            }
            SelectionChange::Selected(id) => {
                tracing::info!(group_id = %id, user_initiated, "Current group selected");
            }
            _ => {}
        }
        self.commit(&session).await?;
        Ok(change)
    }

    /// Clear the selection. Automatic calls are refused.
    pub async fn clear_selection(&self, user_initiated: bool) -> Result<SelectionChange> {
        let mut session = self.session.lock().await;
        session.user()?;
        let change = session.lifecycle.clear_selection(user_initiated);
        if let SelectionChange::Rejected { current } = &change {
            tracing::warn!(current = %current, "Refused automatic selection clear");
        }
        self.commit(&session).await?;
        Ok(change)
    }

    /// The current group among `available`, falling back automatically.
    ///
    /// Only visible groups the signed-in user is a member of are candidates.
    pub async fn current_group(&self, available: &[Group]) -> Result<Option<Group>> {
        let mut session = self.session.lock().await;
        let user = session.user()?.clone();
        let candidates: Vec<Group> = available
            .iter()
            .filter(|g| g.has_member(&user) && session.lifecycle.is_visible(&g.id))
            .cloned()
            .collect();

        let now = self.clock.now();
        let (group, change) = session.lifecycle.current_group(&candidates, now);
        let group = group.cloned();

        match &change {
            SelectionChange::Unchanged => return Ok(group),
            SelectionChange::FellBack { from, to } => {
                tracing::info!(from = ?from, to = ?to, "Selected group unavailable; fell back");
            }
            _ => tracing::debug!(change = ?change, "Current group assigned"),
        }
        self.commit(&session).await?;
        Ok(group)
    }

    /// [`Self::current_group`] over the groups in the local store.
    pub async fn current_group_from_local(&self) -> Result<Option<Group>> {
        let groups = self.local_groups().await?;
        self.current_group(&groups).await
    }

    /// Tombstone a group, then clean up its data locally and remotely.
    ///
    /// The tombstone is persisted before any cleanup runs. Cleanup failures
    /// are counted in the report, never returned.
    pub async fn mark_deleted(&self, group_id: &str) -> Result<CascadeReport> {
        let mut report = self.tombstone(group_id).await?;
        tracing::info!(group_id, cleared_selection = report.cleared_selection, "Group tombstoned");
        self.cascade(group_id, true, &mut report).await;
        Ok(report)
    }

    /// Apply a deletion made on another device: tombstone and clean up
    /// local data only.
    pub async fn apply_remote_deletion(&self, group_id: &str) -> Result<CascadeReport> {
        let mut report = self.tombstone(group_id).await?;
        tracing::info!(group_id, "Group deleted remotely; tombstoned");
        self.cascade(group_id, false, &mut report).await;
        Ok(report)
    }

    async fn tombstone(&self, group_id: &str) -> Result<CascadeReport> {
        let mut session = self.session.lock().await;
        session.user()?;
        let outcome = session.lifecycle.mark_deleted(group_id);
        self.commit(&session).await?;
        Ok(CascadeReport {
            newly_tombstoned: outcome.newly_tombstoned,
            cleared_selection: outcome.cleared_selection,
            ..CascadeReport::default()
        })
    }

    async fn cascade(&self, group_id: &str, remote: bool, report: &mut CascadeReport) {
        let mut handled: HashSet<(EntityType, RecordId)> = HashSet::new();

        for entity in [EntityType::Player, EntityType::Match] {
            let records = match self.local.scoped_to_group(entity, group_id).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(group_id, entity = %entity, error = %e, "Cascade: local scan failed");
                    report.failures += 1;
                    continue;
                }
            };
            for record in records {
                handled.insert((entity, record.id().clone()));
                self.delete_locally(&record, remote, Priority::Normal, report).await;
            }
        }

        match self.local.get(EntityType::Group, group_id).await {
            Ok(Some(group)) => self.delete_locally(&group, remote, Priority::High, report).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(group_id, error = %e, "Cascade: local group lookup failed");
                report.failures += 1;
            }
        }

        if !remote {
            return;
        }

        // Scoped records this device never downloaded.
        for entity in [EntityType::Player, EntityType::Match] {
            let query = Query::collection(entity.collection()).where_eq("groupId", group_id);
            let documents = match self.remote.query_where(&query).await {
                Ok(documents) => documents,
                Err(e) => {
                    tracing::warn!(group_id, entity = %entity, error = %e, "Cascade: remote scan failed");
                    report.failures += 1;
                    continue;
                }
            };
            for document in documents {
                let record = match Record::from_document(entity, document) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(group_id, error = %e, "Cascade: skipping unreadable remote record");
                        report.failures += 1;
                        continue;
                    }
                };
                if handled.insert((entity, record.id().clone())) {
                    self.queue_delete(&record, Priority::Normal, report).await;
                }
            }
        }

        tracing::debug!(
            group_id,
            local_deleted = report.local_deleted,
            remote_deletes_queued = report.remote_deletes_queued,
            failures = report.failures,
            "Cascade cleanup finished"
        );
    }

    async fn delete_locally(&self, record: &Record, remote: bool, priority: Priority, report: &mut CascadeReport) {
        match self.local.delete(record.entity_type(), record.id()).await {
            Ok(true) => report.local_deleted += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(record_id = %record.id(), error = %e, "Cascade: local delete failed");
                report.failures += 1;
            }
        }
        if remote {
            self.queue_delete(record, priority, report).await;
        }
    }

    async fn queue_delete(&self, record: &Record, priority: Priority, report: &mut CascadeReport) {
        match self
            .queue
            .enqueue(OperationKind::Delete, record.entity_type(), Some(record), priority, Origin::Local)
            .await
        {
            Ok(_) => report.remote_deletes_queued += 1,
            Err(e) => {
                tracing::warn!(record_id = %record.id(), error = %e, "Cascade: could not queue remote delete");
                report.failures += 1;
            }
        }
    }

    /// Purge local data of tombstoned groups and revalidate the selection.
    pub async fn audit(&self) -> Result<AuditReport> {
        let tombstones = self.tombstones().await;
        let mut purged_groups = 0;
        let mut purged_records = 0;

        for group_id in &tombstones {
            if self.local.delete(EntityType::Group, group_id).await? {
                purged_groups += 1;
            }
            for entity in [EntityType::Player, EntityType::Match] {
                for record in self.local.scoped_to_group(entity, group_id).await? {
                    if self.local.delete(entity, record.id()).await? {
                        purged_records += 1;
                    }
                }
            }
        }

        let before = self.selection().await;
        self.current_group_from_local().await?;
        let after = self.selection().await;
        let selection = match (before.group_id(), after.group_id()) {
            (a, b) if a == b => SelectionChange::Unchanged,
            (None, Some(id)) => SelectionChange::Selected(id.clone()),
            (from, to) => SelectionChange::FellBack {
                from: from.cloned(),
                to: to.cloned(),
            },
        };

        if purged_groups + purged_records > 0 {
            tracing::info!(purged_groups, purged_records, "Consistency audit purged tombstoned data");
        }
        Ok(AuditReport {
            purged_groups,
            purged_records,
            selection,
        })
    }

    /// Hide a group without deleting it.
    pub async fn hide_group(&self, group_id: &str) -> Result<bool> {
        let mut session = self.session.lock().await;
        session.user()?;
        let changed = session.lifecycle.hide(group_id);
        if changed {
            self.commit(&session).await?;
        }
        Ok(changed)
    }

    /// Un-hide a group. Fails for tombstoned groups.
    pub async fn show_group(&self, group_id: &str) -> Result<bool> {
        let mut session = self.session.lock().await;
        session.user()?;
        let changed = session.lifecycle.show(group_id)?;
        if changed {
            self.commit(&session).await?;
        }
        Ok(changed)
    }

    /// Remove a tombstone. Requires explicit confirmation.
    pub async fn emergency_undelete(&self, group_id: &str, confirmed: bool) -> Result<()> {
        let mut session = self.session.lock().await;
        session.user()?;
        session.lifecycle.emergency_undelete(group_id, confirmed)?;
        tracing::warn!(group_id, "Emergency undelete: tombstone removed");
        self.commit(&session).await
    }

    pub async fn is_visible(&self, group_id: &str) -> bool {
        self.session.lock().await.lifecycle.is_visible(group_id)
    }

    pub async fn is_tombstoned(&self, group_id: &str) -> bool {
        self.session.lock().await.lifecycle.is_tombstoned(group_id)
    }

    /// `groups` without tombstoned or hidden ones.
    pub async fn visible_groups(&self, groups: &[Group]) -> Vec<Group> {
        let session = self.session.lock().await;
        session
            .lifecycle
            .visible_groups(groups)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn tombstones(&self) -> Vec<GroupId> {
        self.session.lock().await.lifecycle.tombstones().cloned().collect()
    }

    pub async fn selection(&self) -> Selection {
        self.session.lock().await.lifecycle.selection().clone()
    }

    /// Observe the selected group id.
    pub fn watch_selection(&self) -> watch::Receiver<Option<GroupId>> {
        self.selection_tx.subscribe()
    }

    async fn local_groups(&self) -> Result<Vec<Group>> {
        Ok(self
            .local
            .get_all(EntityType::Group)
            .await?
            .into_iter()
            .filter_map(|record| match record {
                Record::Group(group) => Some(group),
                _ => None,
            })
            .collect())
    }

    /// Persist, then publish the selection.
    async fn commit(&self, session: &Session) -> Result<()> {
        self.publish(session);
        let Some(user) = &session.user_id else {
            return Ok(());
        };
        let json = session
            .lifecycle
            .snapshot()
            .to_json()
            .map_err(|e| SyncError::State(e.into()))?;
        self.state.save(&keys::lifecycle(user), &json).await?;
        Ok(())
    }

    fn publish(&self, session: &Session) {
        let selected = session.lifecycle.current_group_id().cloned();
        self.selection_tx.send_if_modified(|current| {
            if *current == selected {
                return false;
            }
            *current = selected;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStateStore;
    use crate::memory::{MemoryBackend, MemoryLocalStore};
    use crate::status::StatusTracker;
    use serde_json::json;
    use squad_engine::{Error, ManualClock, Player, RetryPolicy};

    struct Fixture {
        state: Arc<MemoryStateStore>,
        local: Arc<MemoryLocalStore>,
        backend: MemoryBackend,
        queue: Arc<QueueService>,
        manager: GroupLifecycleManager,
    }

    async fn fixture() -> Fixture {
        let state = MemoryStateStore::new_shared();
        let local = MemoryLocalStore::new_shared();
        let backend = MemoryBackend::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let status = Arc::new(StatusTracker::load(state.clone()).await.unwrap());
        let queue = Arc::new(
            QueueService::load(state.clone(), status, clock.clone(), RetryPolicy::default())
                .await
                .unwrap(),
        );
        let manager = GroupLifecycleManager::new(
            state.clone(),
            local.clone(),
            backend.client(),
            queue.clone(),
            clock,
        );
        manager.activate_user(Some("u-1".into())).await.unwrap();
        Fixture {
            state,
            local,
            backend,
            queue,
            manager,
        }
    }

    fn group(id: &str) -> Group {
        Group::new(id, format!("Group {id}"), "u-1", "CODE1", 1).unwrap()
    }

    fn player(id: &str, group_id: &str) -> Record {
        Record::Player(Player {
            id: id.into(),
            group_id: group_id.into(),
            name: "Ada".into(),
            nickname: None,
            active: true,
            last_modified: 1,
        })
    }

    #[tokio::test]
    async fn signed_out_mutations_fail() {
        let f = fixture().await;
        f.manager.activate_user(None).await.unwrap();
        let err = f.manager.set_current_group(&group("g-1"), true).await.unwrap_err();
        assert!(matches!(err, SyncError::NotSignedIn));
        assert!(matches!(f.manager.mark_deleted("g-1").await, Err(SyncError::NotSignedIn)));
    }

    #[tokio::test]
    async fn selection_lock_and_publication() {
        let f = fixture().await;
        let mut rx = f.manager.watch_selection();

        f.manager.set_current_group(&group("g-1"), true).await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some("g-1"));

        let change = f.manager.set_current_group(&group("g-2"), false).await.unwrap();
        assert_eq!(change, SelectionChange::Rejected { current: "g-1".into() });
        assert!(!rx.has_changed().unwrap());

        f.manager.set_current_group(&group("g-2"), true).await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some("g-2"));
    }

    #[tokio::test]
    async fn current_group_only_considers_member_groups() {
        let f = fixture().await;
        let mut foreign = group("g-0");
        foreign.owner_id = "u-2".into();
        foreign.members = vec!["u-2".into()];

        let picked = f.manager.current_group(&[foreign, group("g-5")]).await.unwrap();
        assert_eq!(picked.map(|g| g.id), Some("g-5".to_string()));
    }

    #[tokio::test]
    async fn deletion_tombstones_then_cascades() {
        let f = fixture().await;
        f.local.save(Record::Group(group("g-1"))).await.unwrap();
        f.local.save(player("p-1", "g-1")).await.unwrap();
        f.local.save(player("p-9", "g-2")).await.unwrap();
        f.backend.seed("players", "p-2", json!({
            "id": "p-2", "groupId": "g-1", "name": "Remote", "lastModified": 5
        }));
        f.manager.set_current_group(&group("g-1"), true).await.unwrap();

        let report = f.manager.mark_deleted("g-1").await.unwrap();
        assert!(report.newly_tombstoned);
        assert!(report.cleared_selection);
        assert_eq!(report.local_deleted, 2);
        assert_eq!(report.remote_deletes_queued, 3);
        assert_eq!(report.failures, 0);

        assert!(!f.manager.is_visible("g-1").await);
        assert_eq!(f.manager.selection().await, Selection::Unselected);
        assert!(f.local.get(EntityType::Player, "p-9").await.unwrap().is_some());
        assert_eq!(f.queue.len().await, 3);

        let persisted = f.state.get(&keys::lifecycle("u-1")).unwrap();
        let snapshot = LifecycleSnapshot::from_json(&persisted).unwrap();
        assert!(snapshot.tombstones.contains("g-1"));
    }

    #[tokio::test]
    async fn cascade_tolerates_offline_remote() {
        let f = fixture().await;
        f.local.save(player("p-1", "g-1")).await.unwrap();
        let remote = f.backend.client();
        remote.set_network_enabled(false).await.unwrap();
        let manager = GroupLifecycleManager::new(
            f.state.clone(),
            f.local.clone(),
            remote,
            f.queue.clone(),
            Arc::new(ManualClock::new(0)),
        );
        manager.activate_user(Some("u-1".into())).await.unwrap();

        let report = manager.mark_deleted("g-1").await.unwrap();
        assert_eq!(report.failures, 2);
        assert_eq!(report.local_deleted, 1);
        assert!(manager.is_tombstoned("g-1").await);
    }

    #[tokio::test]
    async fn remote_deletion_queues_nothing() {
        let f = fixture().await;
        f.local.save(player("p-1", "g-1")).await.unwrap();
        let report = f.manager.apply_remote_deletion("g-1").await.unwrap();
        assert_eq!(report.local_deleted, 1);
        assert_eq!(report.remote_deletes_queued, 0);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn state_is_per_user() {
        let f = fixture().await;
        f.manager.mark_deleted("g-1").await.unwrap();

        f.manager.activate_user(Some("u-2".into())).await.unwrap();
        assert!(!f.manager.is_tombstoned("g-1").await);

        f.manager.activate_user(Some("u-1".into())).await.unwrap();
        assert!(f.manager.is_tombstoned("g-1").await);
    }

    #[tokio::test]
    async fn hide_show_and_undelete() {
        let f = fixture().await;
        assert!(f.manager.hide_group("g-1").await.unwrap());
        assert!(!f.manager.is_visible("g-1").await);
        assert!(f.manager.show_group("g-1").await.unwrap());

        f.manager.mark_deleted("g-2").await.unwrap();
        let err = f.manager.show_group("g-2").await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(Error::GroupDeleted(_))));

        let err = f.manager.emergency_undelete("g-2", false).await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(Error::UndeleteNotConfirmed(_))));
        f.manager.emergency_undelete("g-2", true).await.unwrap();
        assert!(f.manager.is_visible("g-2").await);
    }

    #[tokio::test]
    async fn audit_purges_reintroduced_data() {
        let f = fixture().await;
        f.manager.mark_deleted("g-1").await.unwrap();
        // Data that slipped back in after the deletion.
        f.local.save(Record::Group(group("g-1"))).await.unwrap();
        f.local.save(player("p-1", "g-1")).await.unwrap();
        f.local.save(Record::Group(group("g-2"))).await.unwrap();

        let report = f.manager.audit().await.unwrap();
        assert_eq!(report.purged_groups, 1);
        assert_eq!(report.purged_records, 1);
        assert_eq!(report.selection, SelectionChange::Selected("g-2".into()));
    }
}
