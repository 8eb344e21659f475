//! Realtime replication.
//!
//! The push path writes a [`ChangeNotification`] to the shared
//! `realtime_updates` collection right after a local edit. The subscribe
//! path keeps one change stream per watched entity kind (scoped to the
//! signed-in user and the selected group) plus one on the notification
//! feed, and applies everything it receives through a single sequential
//! processor.
//!
//! Every inbound record goes through the conflict resolver before it reaches
//! the local store. Notifications stamped with this device's id are echoes
//! and are dropped unread.

use crate::error::{RemoteError, Result, SyncError};
use crate::lifecycle::GroupLifecycleManager;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::queue::QueueService;
use crate::store::{
    AuthSession, ChangeKind, ChangeStream, DocumentChange, Direction, LocalStore, Query,
    RemoteStore,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use squad_engine::{
    Clock, ConflictResolution, ConflictResolver, DeviceId, EntityType, OperationKind,
    Origin, Priority, Record, RecordId, Timestamp, UserId,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Remote collection carrying change notifications.
pub const NOTIFICATIONS_COLLECTION: &str = "realtime_updates";

/// Matches fetched per group subscription.
const MATCH_SUBSCRIPTION_LIMIT: usize = 50;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A change announced on the notification feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub id: String,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: RecordId,
    /// `user:<id>` or `group:<id>`; subscribers filter on it
    pub scope: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Device that produced the change
    pub device_id: DeviceId,
    pub last_modified: Timestamp,
    #[serde(default)]
    pub payload: Option<Record>,
}

/// Delivered to realtime listeners after a remote change was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeUpdate {
    pub change: ChangeKind,
    pub entity_type: EntityType,
    pub record_id: RecordId,
    /// The stored record; `None` for removals
    pub record: Option<Record>,
}

/// What happened to one inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written locally with the given resolution
    Applied(ConflictResolution),
    /// Same content as the local copy; nothing written
    Unchanged,
    /// Belongs to a deleted group; dropped
    IgnoredTombstoned,
    /// Local copy is strictly newer; an update was queued for the remote
    WroteBack,
}

/// Counters for observing the replicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatorStats {
    pub applied: u64,
    pub unchanged: u64,
    pub suppressed_echoes: u64,
    pub ignored_tombstoned: u64,
    pub write_backs: u64,
    pub failed_applies: u64,
    pub pushed: u64,
    pub deferred_pushes: u64,
    pub active_subscriptions: usize,
    pub retry_list_len: usize,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    unchanged: AtomicU64,
    suppressed_echoes: AtomicU64,
    ignored_tombstoned: AtomicU64,
    write_backs: AtomicU64,
    failed_applies: AtomicU64,
    pushed: AtomicU64,
    deferred_pushes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Replicator settings.
#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub push_max_attempts: u32,
    pub push_base_delay: Duration,
    pub retry_list_capacity: usize,
    pub inbound_item_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Entity(EntityType),
    Notifications,
}

struct Inbound {
    generation: u64,
    source: Source,
    change: DocumentChange,
}

struct ReplicatorInner {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn AuthSession>,
    queue: Arc<QueueService>,
    lifecycle: Arc<GroupLifecycleManager>,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
    device_id: DeviceId,
    settings: ReplicatorSettings,
    listeners: Arc<ListenerRegistry<EntityType, RealtimeUpdate>>,
    retry_list: Mutex<VecDeque<ChangeNotification>>,
    feeds: Mutex<Vec<JoinHandle<()>>>,
    processor: Mutex<Option<JoinHandle<()>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    /// Bumped on every teardown; items from older feeds are dropped.
    generation: AtomicU64,
    counters: Counters,
}

/// Pushes local edits and mirrors remote ones. Cheap to clone.
#[derive(Clone)]
pub struct RealtimeReplicator {
    inner: Arc<ReplicatorInner>,
}

impl RealtimeReplicator {
    /// Create the replicator and start its inbound processor.
    ///
    /// Must be called inside a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        session: Arc<dyn AuthSession>,
        queue: Arc<QueueService>,
        lifecycle: Arc<GroupLifecycleManager>,
        clock: Arc<dyn Clock>,
        resolver: ConflictResolver,
        device_id: DeviceId,
        settings: ReplicatorSettings,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ReplicatorInner {
            local,
            remote,
            session,
            queue,
            lifecycle,
            clock,
            resolver,
            device_id,
            settings,
            listeners: ListenerRegistry::new_shared(),
            retry_list: Mutex::new(VecDeque::new()),
            feeds: Mutex::new(Vec::new()),
            processor: Mutex::new(None),
            inbound_tx,
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let processor = tokio::spawn(process_inbound(Arc::downgrade(&inner), inbound_rx));
        *lock(&inner.processor) = Some(processor);
        Self { inner }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Register a listener for one entity kind, or for every change with
    /// [`EntityType::All`].
    pub fn on_update(
        &self,
        entity: EntityType,
        callback: impl Fn(&RealtimeUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.subscribe(entity, Arc::new(callback))
    }

    /// Announce a local change on the notification feed.
    ///
    /// Retries with exponential backoff; after the last attempt the
    /// notification moves to a bounded in-memory retry list. Returns whether
    /// it was delivered now.
    pub async fn push_instant_update(&self, kind: OperationKind, record: &Record) -> Result<bool> {
        let user_id = self.inner.session.current_user_id().ok_or(SyncError::NotSignedIn)?;
        let now = self.inner.clock.now();
        let scope = match record.entity_type() {
            EntityType::Player | EntityType::Match => match record.group_scope() {
                Some(group_id) => format!("group:{group_id}"),
                None => format!("user:{user_id}"),
            },
            _ => format!("user:{user_id}"),
        };

        let notification = ChangeNotification {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_type: record.entity_type(),
            entity_id: record.id().clone(),
            scope,
            user_id: Some(user_id),
            device_id: self.inner.device_id.clone(),
            last_modified: now,
            payload: Some(record.clone().with_last_modified(now)),
        };
        self.inner.deliver(notification).await
    }

    /// Tear down the feeds and subscribe for `user_id` and `group_id`.
    ///
    /// Without a user nothing is subscribed.
    pub async fn resubscribe(&self, user_id: Option<&str>, group_id: Option<&str>) {
        self.teardown();
        let Some(user_id) = user_id else {
            return;
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);

        let mut feeds: Vec<(Source, Query)> = vec![
            (
                Source::Entity(EntityType::User),
                Query::collection(EntityType::User.collection()).where_eq("id", user_id),
            ),
            (
                Source::Entity(EntityType::Group),
                Query::collection(EntityType::Group.collection())
                    .array_contains("members", user_id)
                    .order_by("lastModified", Direction::Descending),
            ),
        ];
        let mut scopes = vec![serde_json::Value::from(format!("user:{user_id}"))];
        if let Some(group_id) = group_id {
            feeds.push((
                Source::Entity(EntityType::Player),
                Query::collection(EntityType::Player.collection())
                    .where_eq("groupId", group_id)
                    .order_by("name", Direction::Ascending),
            ));
            feeds.push((
                Source::Entity(EntityType::Match),
                Query::collection(EntityType::Match.collection())
                    .where_eq("groupId", group_id)
                    .order_by("playedAt", Direction::Descending)
                    .limit(MATCH_SUBSCRIPTION_LIMIT),
            ));
            scopes.push(format!("group:{group_id}").into());
        }
        feeds.push((
            Source::Notifications,
            Query::collection(NOTIFICATIONS_COLLECTION)
                .where_in("scope", scopes)
                .where_gte("lastModified", self.inner.clock.now())
                .order_by("lastModified", Direction::Ascending),
        ));

        let mut handles = Vec::with_capacity(feeds.len());
        for (source, query) in feeds {
            match self.inner.subscribe_with_fallback(&query).await {
                Ok(stream) => handles.push(self.inner.spawn_feed(generation, source, stream)),
                Err(e) => {
                    tracing::error!(source = ?source, error = %e, "Subscription failed; feed unavailable");
                }
            }
        }

        tracing::info!(
            user_id,
            group_id = ?group_id,
            feeds = handles.len(),
            "Realtime subscriptions established"
        );
        *lock(&self.inner.feeds) = handles;
    }

    /// Stop every feed. Items already received but not applied are dropped.
    pub fn teardown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let feeds = std::mem::take(&mut *lock(&self.inner.feeds));
        if !feeds.is_empty() {
            tracing::debug!(feeds = feeds.len(), "Tearing down realtime subscriptions");
        }
        for feed in feeds {
            feed.abort();
        }
    }

    /// Tear down the feeds and stop the inbound processor.
    pub fn shutdown(&self) {
        self.teardown();
        if let Some(processor) = lock(&self.inner.processor).take() {
            processor.abort();
        }
    }

    /// Apply one remote record through the conflict resolver.
    pub async fn apply_remote_record(&self, record: Record) -> Result<ApplyOutcome> {
        self.inner.apply_remote_record(record).await
    }

    /// Retry deferred notifications now.
    pub async fn flush_retry_list(&self) -> usize {
        self.inner.drain_retry_list().await
    }

    pub fn stats(&self) -> ReplicatorStats {
        let c = &self.inner.counters;
        ReplicatorStats {
            applied: c.applied.load(Ordering::Relaxed),
            unchanged: c.unchanged.load(Ordering::Relaxed),
            suppressed_echoes: c.suppressed_echoes.load(Ordering::Relaxed),
            ignored_tombstoned: c.ignored_tombstoned.load(Ordering::Relaxed),
            write_backs: c.write_backs.load(Ordering::Relaxed),
            failed_applies: c.failed_applies.load(Ordering::Relaxed),
            pushed: c.pushed.load(Ordering::Relaxed),
            deferred_pushes: c.deferred_pushes.load(Ordering::Relaxed),
            active_subscriptions: lock(&self.inner.feeds).iter().filter(|f| !f.is_finished()).count(),
            retry_list_len: lock(&self.inner.retry_list).len(),
        }
    }
}

impl ReplicatorInner {
    async fn deliver(&self, notification: ChangeNotification) -> Result<bool> {
        let document = serde_json::to_value(&notification)
            .map_err(|e| RemoteError::InvalidData(e.to_string()))?;
        let max_attempts = self.settings.push_max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self
                .remote
                .write(NOTIFICATIONS_COLLECTION, &notification.id, document.clone(), false)
                .await
            {
                Ok(()) => {
                    bump(&self.counters.pushed);
                    tracing::debug!(
                        notification_id = %notification.id,
                        entity = %notification.entity_type,
                        entity_id = %notification.entity_id,
                        "Pushed {} notification",
                        notification.kind
                    );
                    self.drain_retry_list().await;
                    return Ok(true);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.settings.push_base_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        notification_id = %notification.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Realtime push failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Realtime push failed; deferring to retry list"
                    );
                    self.defer(notification);
                    return Ok(false);
                }
            }
        }
    }

    fn defer(&self, notification: ChangeNotification) {
        bump(&self.counters.deferred_pushes);
        let mut list = lock(&self.retry_list);
        list.push_back(notification);
        while list.len() > self.settings.retry_list_capacity {
            if let Some(dropped) = list.pop_front() {
                tracing::warn!(notification_id = %dropped.id, "Retry list full; dropped oldest notification");
            }
        }
    }

    /// One attempt per deferred notification. Returns how many went out.
    async fn drain_retry_list(&self) -> usize {
        let pending: Vec<ChangeNotification> = lock(&self.retry_list).drain(..).collect();
        if pending.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for notification in pending {
            let written = match serde_json::to_value(&notification) {
                Ok(document) => self
                    .remote
                    .write(NOTIFICATIONS_COLLECTION, &notification.id, document, false)
                    .await
                    .is_ok(),
                Err(_) => false,
            };
            if written {
                bump(&self.counters.pushed);
                delivered += 1;
            } else {
                failed.push(notification);
            }
        }

        if !failed.is_empty() {
            let mut list = lock(&self.retry_list);
            for notification in failed.into_iter().rev() {
                list.push_front(notification);
            }
            while list.len() > self.settings.retry_list_capacity {
                list.pop_front();
            }
        }
        if delivered > 0 {
            tracing::debug!(delivered, "Flushed deferred realtime notifications");
        }
        delivered
    }

    async fn subscribe_with_fallback(
        &self,
        query: &Query,
    ) -> std::result::Result<ChangeStream, RemoteError> {
        match self.remote.subscribe(query).await {
            Ok(stream) => Ok(stream),
            Err(e) if query.is_ordered() => {
                tracing::warn!(
                    collection = %query.collection,
                    error = %e,
                    "Ordered subscription failed; falling back to unordered"
                );
                self.remote.subscribe(&query.unordered()).await
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_feed(&self, generation: u64, source: Source, mut stream: ChangeStream) -> JoinHandle<()> {
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(batch) = stream.next().await {
                match batch {
                    Ok(changes) => {
                        for change in changes {
                            if tx.send(Inbound { generation, source, change }).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(source = ?source, error = %e, "Subscription error");
                    }
                }
            }
            tracing::debug!(source = ?source, "Subscription stream ended");
        })
    }

    async fn handle(&self, inbound: Inbound) {
        if inbound.generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        let result = match inbound.source {
            Source::Entity(entity) => self.apply_change(entity, inbound.change).await,
            Source::Notifications => self.apply_notification(inbound.change).await,
        };
        if let Err(e) = result {
            bump(&self.counters.failed_applies);
            tracing::warn!(error = %e, "Failed to apply inbound change");
        }
    }

    async fn apply_change(&self, entity: EntityType, change: DocumentChange) -> Result<()> {
        if change.kind == ChangeKind::Removed {
            return self.confirm_removal(entity, &change.id).await;
        }
        let record = Record::from_document(entity, change.data)?;
        self.apply_remote_record(record).await?;
        Ok(())
    }

    async fn apply_notification(&self, change: DocumentChange) -> Result<()> {
        if change.kind == ChangeKind::Removed {
            return Ok(());
        }
        let notification: ChangeNotification = serde_json::from_value(change.data)
            .map_err(|e| RemoteError::InvalidData(e.to_string()))?;

        if notification.device_id == self.device_id {
            bump(&self.counters.suppressed_echoes);
            tracing::debug!(notification_id = %notification.id, "Suppressed own echo");
            return Ok(());
        }

        match (notification.kind, notification.entity_type) {
            (OperationKind::Delete, EntityType::Group) => {
                self.lifecycle.apply_remote_deletion(&notification.entity_id).await?;
                self.notify(RealtimeUpdate {
                    change: ChangeKind::Removed,
                    entity_type: EntityType::Group,
                    record_id: notification.entity_id,
                    record: None,
                });
                Ok(())
            }
            (OperationKind::Delete, entity) => self.remove_locally(entity, &notification.entity_id).await,
            (OperationKind::DownloadAll, _) => Ok(()),
            (_, _) => {
                let record = notification
                    .payload
                    .ok_or(squad_engine::Error::MissingPayload(notification.kind))?;
                self.apply_remote_record(record).await?;
                Ok(())
            }
        }
    }

    /// A feed reports "removed" both for deletions and for documents that
    /// merely left its result set (the match window, a changed filter
    /// field). Only a confirmed deletion removes the local copy.
    async fn confirm_removal(&self, entity: EntityType, id: &str) -> Result<()> {
        match self.remote.read(entity.collection(), id).await {
            Ok(None) => self.remove_locally(entity, id).await,
            Ok(Some(_)) => {
                tracing::debug!(entity = %entity, record_id = id, "Document left subscription window; keeping local copy");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(entity = %entity, record_id = id, error = %e, "Could not confirm remote removal; keeping local copy");
                Ok(())
            }
        }
    }

    async fn remove_locally(&self, entity: EntityType, id: &str) -> Result<()> {
        if self.local.delete(entity, id).await? {
            tracing::debug!(entity = %entity, record_id = id, "Applied remote removal");
            self.notify(RealtimeUpdate {
                change: ChangeKind::Removed,
                entity_type: entity,
                record_id: id.to_string(),
                record: None,
            });
        }
        Ok(())
    }

    async fn apply_remote_record(&self, remote: Record) -> Result<ApplyOutcome> {
        remote.validate()?;
        if let Some(group_id) = remote.group_scope() {
            if self.lifecycle.is_tombstoned(group_id).await {
                bump(&self.counters.ignored_tombstoned);
                tracing::debug!(record_id = %remote.id(), group_id = %group_id, "Ignored record of deleted group");
                return Ok(ApplyOutcome::IgnoredTombstoned);
            }
        }

        let entity = remote.entity_type();
        let local = self.local.get(entity, remote.id()).await?;
        if local.as_ref().is_some_and(|l| l.same_content(&remote)) {
            bump(&self.counters.unchanged);
            return Ok(ApplyOutcome::Unchanged);
        }

        let now = self.clock.now();
        let Some(resolved) = self.resolver.resolve(local.as_ref(), Some(&remote), now) else {
            return Ok(ApplyOutcome::Unchanged);
        };

        match resolved.resolution {
            ConflictResolution::LocalWins => {
                // The remote replica is stale; send the local value back.
                self.queue
                    .enqueue(
                        OperationKind::Update,
                        entity,
                        Some(&resolved.record),
                        Priority::Low,
                        Origin::ConflictResolution,
                    )
                    .await?;
                bump(&self.counters.write_backs);
                tracing::debug!(entity = %entity, record_id = %remote.id(), "Local copy newer; queued write-back");
                Ok(ApplyOutcome::WroteBack)
            }
            ConflictResolution::LocalOnly => Ok(ApplyOutcome::Unchanged),
            resolution => {
                let change = if local.is_some() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                };
                self.local.save(resolved.record.clone()).await?;
                bump(&self.counters.applied);
                tracing::debug!(
                    entity = %entity,
                    record_id = %resolved.record.id(),
                    resolution = ?resolution,
                    "Applied remote record"
                );
                self.notify(RealtimeUpdate {
                    change,
                    entity_type: entity,
                    record_id: resolved.record.id().clone(),
                    record: Some(resolved.record),
                });
                Ok(ApplyOutcome::Applied(resolution))
            }
        }
    }

    fn notify(&self, update: RealtimeUpdate) {
        self.listeners.notify(&update.entity_type, &update);
        self.listeners.notify(&EntityType::All, &update);
    }
}

impl Drop for ReplicatorInner {
    fn drop(&mut self) {
        for feed in lock(&self.feeds).drain(..) {
            feed.abort();
        }
        if let Some(processor) = lock(&self.processor).take() {
            processor.abort();
        }
    }
}

async fn process_inbound(inner: Weak<ReplicatorInner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(inbound).await;
        let delay = inner.settings.inbound_item_delay;
        drop(inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStateStore;
    use crate::memory::{MemoryBackend, MemoryLocalStore, MemoryRemote, StaticSession};
    use crate::status::StatusTracker;
    use serde_json::json;
    use squad_engine::{ManualClock, Player, RetryPolicy};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemote>,
        backend: MemoryBackend,
        queue: Arc<QueueService>,
        lifecycle: Arc<GroupLifecycleManager>,
        clock: Arc<ManualClock>,
        replicator: RealtimeReplicator,
    }

    async fn fixture(device: &str) -> Fixture {
        let backend = MemoryBackend::new();
        let remote = backend.client();
        let state = MemoryStateStore::new_shared();
        let local = MemoryLocalStore::new_shared();
        let clock = Arc::new(ManualClock::new(100_000));
        let status = Arc::new(StatusTracker::load(state.clone()).await.unwrap());
        let queue = Arc::new(
            QueueService::load(state.clone(), status, clock.clone(), RetryPolicy::default())
                .await
                .unwrap(),
        );
        let lifecycle = Arc::new(GroupLifecycleManager::new(
            state,
            local.clone(),
            remote.clone(),
            queue.clone(),
            clock.clone(),
        ));
        lifecycle.activate_user(Some("u-1".into())).await.unwrap();
        let replicator = RealtimeReplicator::new(
            local.clone(),
            remote.clone(),
            StaticSession::signed_in("u-1"),
            queue.clone(),
            lifecycle.clone(),
            clock.clone(),
            ConflictResolver::new(5_000),
            device.to_string(),
            ReplicatorSettings {
                push_max_attempts: 3,
                push_base_delay: Duration::from_millis(500),
                retry_list_capacity: 2,
                inbound_item_delay: Duration::ZERO,
            },
        );
        Fixture {
            local,
            remote,
            backend,
            queue,
            lifecycle,
            clock,
            replicator,
        }
    }

    fn player(name: &str, last_modified: Timestamp) -> Record {
        Record::Player(Player {
            id: "p-1".into(),
            group_id: "g-1".into(),
            name: name.into(),
            nickname: None,
            active: true,
            last_modified,
        })
    }

    #[tokio::test]
    async fn newer_remote_replaces_local_and_notifies() {
        let f = fixture("dev-a").await;
        f.local.save(player("Old", 10_000)).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = f.replicator.on_update(EntityType::All, move |update| {
            assert_eq!(update.change, ChangeKind::Modified);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = f.replicator.apply_remote_record(player("New", 90_000)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(ConflictResolution::RemoteWins));
        assert_eq!(f.local.get(EntityType::Player, "p-1").await.unwrap(), Some(player("New", 90_000)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recency_window_keeps_local_without_write_back() {
        let f = fixture("dev-a").await;
        f.local.save(player("Local", 1_000)).await.unwrap();

        let outcome = f.replicator.apply_remote_record(player("Remote", 1_050)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(ConflictResolution::Merged));
        let stored = f.local.get(EntityType::Player, "p-1").await.unwrap().unwrap();
        assert_eq!(stored, player("Local", 100_000));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn stale_remote_triggers_write_back() {
        let f = fixture("dev-a").await;
        f.local.save(player("Local", 90_000)).await.unwrap();

        let outcome = f.replicator.apply_remote_record(player("Stale", 1_000)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::WroteBack);
        let ops = f.queue.operations().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].origin, Origin::ConflictResolution);
        assert_eq!(ops[0].priority, Priority::Low);
    }

    #[tokio::test]
    async fn identical_content_is_not_rewritten() {
        let f = fixture("dev-a").await;
        f.local.save(player("Same", 1_000)).await.unwrap();
        let outcome = f.replicator.apply_remote_record(player("Same", 80_000)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(f.replicator.stats().unchanged, 1);
    }

    #[tokio::test]
    async fn tombstoned_groups_ignore_inbound_records() {
        let f = fixture("dev-a").await;
        f.lifecycle.mark_deleted("g-1").await.unwrap();
        let outcome = f.replicator.apply_remote_record(player("Ghost", 200_000)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::IgnoredTombstoned);
        assert!(f.local.get(EntityType::Player, "p-1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pushes_are_deferred_and_flushed() {
        let f = fixture("dev-a").await;
        f.remote.fail_next(3, RemoteError::Timeout);

        let pushed = f
            .replicator
            .push_instant_update(OperationKind::Update, &player("Ada", 1))
            .await
            .unwrap();
        assert!(!pushed);
        assert_eq!(f.replicator.stats().retry_list_len, 1);

        let pushed = f
            .replicator
            .push_instant_update(OperationKind::Update, &player("Bea", 2))
            .await
            .unwrap();
        assert!(pushed);
        let stats = f.replicator.stats();
        assert_eq!(stats.retry_list_len, 0);
        assert_eq!(stats.pushed, 2);
        assert_eq!(f.backend.documents(NOTIFICATIONS_COLLECTION).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_list_drops_oldest_when_full() {
        let f = fixture("dev-a").await;
        f.remote.fail_always(Some(RemoteError::Timeout));
        for n in 0..3 {
            f.replicator
                .push_instant_update(OperationKind::Update, &player("Ada", n))
                .await
                .unwrap();
        }
        let stats = f.replicator.stats();
        assert_eq!(stats.deferred_pushes, 3);
        assert_eq!(stats.retry_list_len, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn own_notifications_are_suppressed() {
        let f = fixture("dev-a").await;
        f.replicator.resubscribe(Some("u-1"), Some("g-1")).await;

        f.clock.advance(10);
        f.replicator
            .push_instant_update(OperationKind::Update, &player("Ada", 1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = f.replicator.stats();
        assert_eq!(stats.suppressed_echoes, 1);
        assert_eq!(stats.applied, 0);
        assert!(f.local.get(EntityType::Player, "p-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removal_is_confirmed_before_deleting_locally() {
        let f = fixture("dev-b").await;
        let record = player("Ada", 100_000);
        f.local.save(record.clone()).await.unwrap();
        f.backend.seed("players", "p-1", record.to_document());
        let removed = DocumentChange {
            kind: ChangeKind::Removed,
            id: "p-1".into(),
            data: serde_json::Value::Null,
        };

        // Still present remotely: it only left the feed's window.
        f.replicator
            .inner
            .apply_change(EntityType::Player, removed.clone())
            .await
            .unwrap();
        assert!(f.local.get(EntityType::Player, "p-1").await.unwrap().is_some());

        f.remote.delete("players", "p-1").await.unwrap();
        f.replicator
            .inner
            .apply_change(EntityType::Player, removed)
            .await
            .unwrap();
        assert!(f.local.get(EntityType::Player, "p-1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_subscription_failure_falls_back() {
        let f = fixture("dev-a").await;
        f.remote.fail_ordered_subscriptions(true);
        f.backend.seed("players", "p-1", json!({
            "id": "p-1", "groupId": "g-1", "name": "Seeded", "lastModified": 5
        }));

        f.replicator.resubscribe(Some("u-1"), Some("g-1")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.replicator.stats().active_subscriptions, 5);
        let stored = f.local.get(EntityType::Player, "p-1").await.unwrap();
        assert_eq!(stored.map(|r| r.last_modified()), Some(5));

        f.replicator.resubscribe(None, None).await;
        assert_eq!(f.replicator.stats().active_subscriptions, 0);
    }
}
