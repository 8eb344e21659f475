//! The sync engine.
//!
//! Turns queued intent into remote effect. Local edits are saved, queued and
//! announced immediately; a foreground timer drains the queue in small
//! batches, a background timer additionally downloads everything and audits
//! local consistency, and network transitions trigger a drain plus a full
//! download after a settle delay.

use crate::clock::MonotonicClock;
use crate::config::SyncConfig;
use crate::db::StateStore;
use crate::device::load_or_create_device_id;
use crate::error::{RemoteError, Result, SyncError};
use crate::lifecycle::{AuditReport, CascadeReport, GroupLifecycleManager};
use crate::listeners::Subscription;
use crate::queue::QueueService;
use crate::replicator::{ApplyOutcome, RealtimeReplicator, RealtimeUpdate, ReplicatorSettings};
use crate::status::StatusTracker;
use crate::store::{AuthSession, LocalStore, Query, RemoteStore};
use squad_engine::{
    normalize_invite_code, Clock, DeviceId, EntityType, FailureOutcome, Group,
    Match, OperationId, OperationKind, Origin, Player, Priority, Record, SelectionChange,
    SyncOperation, SyncStatus, Timestamp, User,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Offline,
    AlreadyDraining,
    Empty,
    /// Operations are pending but all are waiting out a backoff
    NothingDue,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub skipped: Option<SkipReason>,
}

impl DrainReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Whether every attempted operation succeeded.
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.abandoned == 0
    }
}

/// Outcome of a comprehensive download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub applied: usize,
    pub unchanged: usize,
    pub ignored: usize,
    pub written_back: usize,
    pub failed: usize,
}

impl DownloadReport {
    fn count(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied(_) => self.applied += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
            ApplyOutcome::IgnoredTombstoned => self.ignored += 1,
            ApplyOutcome::WroteBack => self.written_back += 1,
        }
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn AuthSession>,
    state: Arc<dyn StateStore>,
    config: SyncConfig,
    clock: Option<Arc<dyn Clock>>,
    online: bool,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (defaults to [`MonotonicClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Initial network state (defaults to online).
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Restore persisted state and start the session watcher.
    ///
    /// Auto sync starts disabled; call [`SyncEngine::enable_auto_sync`].
    pub async fn build(self) -> Result<SyncEngine> {
        let Self {
            local,
            remote,
            session,
            state,
            config,
            clock,
            online,
        } = self;
        let clock = clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);

        let device_id = load_or_create_device_id(state.as_ref()).await?;
        let status = Arc::new(StatusTracker::load(state.clone()).await?);
        let queue = Arc::new(
            QueueService::load(state.clone(), status.clone(), clock.clone(), config.retry_policy()).await?,
        );
        let lifecycle = Arc::new(GroupLifecycleManager::new(
            state,
            local.clone(),
            remote.clone(),
            queue.clone(),
            clock.clone(),
        ));
        lifecycle.activate_user(session.current_user_id()).await?;

        let replicator = RealtimeReplicator::new(
            local.clone(),
            remote.clone(),
            session.clone(),
            queue.clone(),
            lifecycle.clone(),
            clock.clone(),
            config.resolver(),
            device_id.clone(),
            ReplicatorSettings {
                push_max_attempts: config.push_max_attempts,
                push_base_delay: config.push_base_delay,
                retry_list_capacity: config.retry_list_capacity,
                inbound_item_delay: config.inbound_item_delay,
            },
        );

        if let Err(e) = remote.set_network_enabled(online).await {
            tracing::warn!(error = %e, "Failed to set initial network state");
        }
        status.update(|s| s.online = online).await;

        let engine = SyncEngine {
            inner: Arc::new(EngineInner {
                local,
                remote,
                session,
                config,
                clock,
                device_id,
                status,
                queue,
                lifecycle,
                replicator,
                enabled: AtomicBool::new(false),
                online: AtomicBool::new(online),
                drain_lock: tokio::sync::Mutex::new(()),
                auto_sync_tasks: Mutex::new(Vec::new()),
                settle_task: Mutex::new(None),
                watchers: Mutex::new(Vec::new()),
            }),
        };

        engine.refresh_subscriptions().await;
        engine.spawn_session_watcher();

        tracing::info!(
            device_id = %engine.inner.device_id,
            pending = engine.inner.queue.len().await,
            online,
            "Sync engine ready"
        );
        Ok(engine)
    }
}

struct EngineInner {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn AuthSession>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    device_id: DeviceId,
    status: Arc<StatusTracker>,
    queue: Arc<QueueService>,
    lifecycle: Arc<GroupLifecycleManager>,
    replicator: RealtimeReplicator,
    enabled: AtomicBool,
    online: AtomicBool,
    /// One drain in flight at a time.
    drain_lock: tokio::sync::Mutex<()>,
    auto_sync_tasks: Mutex<Vec<JoinHandle<()>>>,
    settle_task: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for task in lock(&self.auto_sync_tasks)
            .drain(..)
            .chain(lock(&self.settle_task).take())
            .chain(lock(&self.watchers).drain(..))
        {
            task.abort();
        }
        self.queue.cancel_all_retry_timers();
        self.replicator.shutdown();
    }
}

/// Multi-device sync engine. Cheap to clone; background tasks hold weak
/// references, so dropping the last clone stops everything.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        session: Arc<dyn AuthSession>,
        state: Arc<dyn StateStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            local,
            remote,
            session,
            state,
            config: SyncConfig::default(),
            clock: None,
            online: true,
        }
    }

    fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ========================================================================
    // Auto sync
    // ========================================================================

    /// Start the foreground and background timers and the high-priority
    /// trigger. The first drain runs immediately.
    pub async fn enable_auto_sync(&self) {
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.status.update(|s| s.enabled = true).await;
        self.rearm_high_priority();
        tracing::info!(
            foreground_secs = self.inner.config.foreground_interval.as_secs(),
            background_secs = self.inner.config.background_interval.as_secs(),
            "Auto sync enabled"
        );

        let foreground = {
            let weak = self.downgrade();
            let period = self.inner.config.foreground_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(engine) = Self::upgrade(&weak) else { break };
                    engine.drain(false).await;
                }
            })
        };

        let background = {
            let weak = self.downgrade();
            let period = self.inner.config.background_interval;
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(engine) = Self::upgrade(&weak) else { break };
                    engine.background_sync().await;
                }
            })
        };

        let high_priority = {
            let weak = self.downgrade();
            let queue = self.inner.queue.clone();
            tokio::spawn(async move {
                loop {
                    queue.high_priority_enqueued().await;
                    let Some(engine) = Self::upgrade(&weak) else { break };
                    // A reconnect since the wake-up leaves the drain to the settle task.
                    if engine.is_online() && !engine.settle_pending() {
                        tracing::debug!("High priority operation queued; draining");
                        engine.drain(false).await;
                    }
                }
            })
        };

        lock(&self.inner.auto_sync_tasks).extend([foreground, background, high_priority]);
    }

    /// Stop the timers and pending retry wake-ups. The queue is kept.
    pub async fn disable_auto_sync(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.inner.auto_sync_tasks).drain(..) {
            task.abort();
        }
        self.rearm_high_priority();
        self.inner.queue.cancel_all_retry_timers();
        self.inner.status.update(|s| s.enabled = false).await;
        tracing::info!("Auto sync disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// HIGH priority enqueues drain immediately only while online and enabled.
    fn rearm_high_priority(&self) {
        self.inner
            .queue
            .arm_high_priority(self.is_online() && self.is_enabled());
    }

    fn settle_pending(&self) -> bool {
        lock(&self.inner.settle_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn background_sync(&self) {
        self.inner.status.update(|s| s.background_sync_in_progress = true).await;
        tracing::debug!("Background sync started");

        self.drain(false).await;
        if self.is_online() {
            if let Err(e) = self.download_all().await {
                tracing::warn!(error = %e, "Background download failed");
            }
        }
        if let Err(e) = self.consistency_audit().await {
            tracing::warn!(error = %e, "Consistency audit failed");
        }

        self.inner.status.update(|s| s.background_sync_in_progress = false).await;
    }

    // ========================================================================
    // Draining
    // ========================================================================

    /// Run one bounded batch of due operations against the remote.
    ///
    /// Without `forced`, returns immediately when another drain is in
    /// flight; with it, waits for that drain to finish first.
    pub async fn drain(&self, forced: bool) -> DrainReport {
        if !self.is_enabled() {
            return DrainReport::skipped(SkipReason::Disabled);
        }
        if !self.is_online() {
            return DrainReport::skipped(SkipReason::Offline);
        }

        let _guard = if forced {
            self.inner.drain_lock.lock().await
        } else {
            match self.inner.drain_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return DrainReport::skipped(SkipReason::AlreadyDraining),
            }
        };

        let queue = &self.inner.queue;
        if queue.is_empty().await {
            return DrainReport::skipped(SkipReason::Empty);
        }
        let batch = queue.dequeue_batch(self.inner.config.batch_size).await;
        if batch.is_empty() {
            return DrainReport::skipped(SkipReason::NothingDue);
        }

        tracing::debug!(batch = batch.len(), "Draining sync queue");
        let mut report = DrainReport::default();
        for (index, op) in batch.iter().enumerate() {
            if index > 0 && !self.inner.config.inter_operation_delay.is_zero() {
                tokio::time::sleep(self.inner.config.inter_operation_delay).await;
            }
            if !self.is_online() {
                tracing::info!("Went offline mid-drain; stopping");
                break;
            }
            // Superseded or removed while we were waiting.
            if !queue.contains(&op.id).await {
                continue;
            }

            report.attempted += 1;
            match self.execute(op).await {
                Ok(()) => {
                    queue.complete(&op.id).await;
                    report.succeeded += 1;
                    tracing::debug!(op_id = %op.id, "Synced {}", op.describe());
                }
                Err(e) if e.is_quota() => {
                    if self.recover_from_quota(op, &e).await {
                        report.succeeded += 1;
                    } else {
                        report.abandoned += 1;
                    }
                }
                Err(e) => match queue.fail(&op.id, &e.to_string()).await {
                    Some(FailureOutcome::Retry { id, next_attempt_at, .. }) => {
                        self.schedule_retry(&id, next_attempt_at);
                        report.retried += 1;
                    }
                    Some(FailureOutcome::Abandoned(_)) => report.abandoned += 1,
                    None => {}
                },
            }
        }

        if report.attempted > 0 && report.is_clean() {
            let now = self.inner.clock.now();
            self.inner.status.update(|s| s.mark_synced(now)).await;
        }
        tracing::debug!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            retried = report.retried,
            abandoned = report.abandoned,
            "Drain finished"
        );
        report
    }

    async fn execute(&self, op: &SyncOperation) -> std::result::Result<(), RemoteError> {
        let remote = &self.inner.remote;
        let collection = op.entity_type.collection();

        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                let record = op.payload.as_ref().ok_or_else(|| {
                    RemoteError::InvalidData(format!("{} has no payload", op.describe()))
                })?;
                if let Some(group_id) = record.group_scope() {
                    if self.inner.lifecycle.is_tombstoned(group_id).await {
                        tracing::debug!(op_id = %op.id, group_id = %group_id, "Dropping write for deleted group");
                        return Ok(());
                    }
                }
                remote.write(collection, record.id(), record.to_document(), true).await
            }
            OperationKind::Delete => {
                let id = op.record_id().ok_or_else(|| {
                    RemoteError::InvalidData(format!("{} has no record id", op.describe()))
                })?;
                remote.delete(collection, id).await
            }
            OperationKind::DownloadAll => self
                .download_all()
                .await
                .map(|_| ())
                .map_err(SyncError::into_remote),
        }
    }

    /// Clear remote protocol caches, wait, and retry once. Abandons the
    /// operation if the retry fails too.
    async fn recover_from_quota(&self, op: &SyncOperation, error: &RemoteError) -> bool {
        tracing::warn!(op_id = %op.id, error = %error, "Quota exceeded; clearing remote cache and retrying once");
        if let Err(e) = self.inner.remote.clear_cache().await {
            tracing::warn!(error = %e, "Failed to clear remote cache");
        }
        tokio::time::sleep(self.inner.config.quota_recovery_delay).await;

        match self.execute(op).await {
            Ok(()) => {
                tracing::info!(op_id = %op.id, "Quota recovery succeeded");
                self.inner.queue.complete(&op.id).await;
                true
            }
            Err(e) => {
                let message = format!("quota recovery failed: {e}");
                self.inner.queue.abandon(&op.id, &message).await;
                false
            }
        }
    }

    fn schedule_retry(&self, id: &OperationId, next_attempt_at: Timestamp) {
        let delay = Duration::from_millis(next_attempt_at.saturating_sub(self.inner.clock.now()));
        let weak = self.downgrade();
        let op_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = Self::upgrade(&weak) else { return };
            engine.inner.queue.forget_retry_timer(&op_id);
            tracing::debug!(op_id = %op_id, "Retry timer fired");
            engine.drain(true).await;
        });
        self.inner.queue.track_retry_timer(id, timer.abort_handle());
    }

    /// Drain everything that is due and download all remote data.
    ///
    /// Waits for an in-flight drain instead of skipping. Returns whether
    /// every step succeeded.
    pub async fn force_sync_now(&self) -> Result<bool> {
        if !self.is_enabled() {
            return Err(SyncError::Disabled);
        }
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        tracing::info!("Manual sync requested");

        let mut clean = true;
        loop {
            let report = self.drain(true).await;
            clean &= report.is_clean();
            if report.attempted == 0 || !report.is_clean() || !self.is_online() {
                break;
            }
        }

        match self.download_all().await {
            Ok(report) => clean &= report.failed == 0,
            Err(e) => {
                tracing::warn!(error = %e, "Manual sync download failed");
                let message = format!("download failed: {e}");
                self.inner.status.update(|s| s.push_error(message)).await;
                clean = false;
            }
        }
        Ok(clean)
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// Record a network transition.
    ///
    /// Going offline stops draining. Coming online drains and downloads
    /// everything after the settle delay.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if !online || was_online {
            self.rearm_high_priority();
        }
        if let Err(e) = self.inner.remote.set_network_enabled(online).await {
            tracing::warn!(error = %e, "Failed to toggle remote network access");
        }
        self.inner.status.update(|s| s.online = online).await;
        if was_online == online {
            return;
        }

        if let Some(task) = lock(&self.inner.settle_task).take() {
            task.abort();
        }
        if !online {
            tracing::info!("Network offline; queueing locally");
            return;
        }

        tracing::info!(
            settle_ms = self.inner.config.online_settle_delay.as_millis() as u64,
            "Network online; resync scheduled"
        );
        let weak = self.downgrade();
        let settle = self.inner.config.online_settle_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(engine) = Self::upgrade(&weak) else { return };
            if !engine.is_online() || !engine.is_enabled() {
                return;
            }
            engine.drain(false).await;
            if let Err(e) = engine.download_all().await {
                tracing::warn!(error = %e, "Resync download failed; queueing DOWNLOAD_ALL");
                let queued = engine
                    .inner
                    .queue
                    .enqueue(OperationKind::DownloadAll, EntityType::All, None, Priority::Normal, Origin::Local)
                    .await;
                if let Err(e) = queued {
                    tracing::error!(error = %e, "Failed to queue DOWNLOAD_ALL");
                }
            }
        });
        *lock(&self.inner.settle_task) = Some(task);
        self.rearm_high_priority();
    }

    /// Follow a stream of network states.
    pub fn watch_network(&self, mut network: watch::Receiver<bool>) {
        let weak = self.downgrade();
        let task = tokio::spawn(async move {
            while network.changed().await.is_ok() {
                let online = *network.borrow_and_update();
                let Some(engine) = Self::upgrade(&weak) else { break };
                engine.set_online(online).await;
            }
        });
        lock(&self.inner.watchers).push(task);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Download and audit
    // ========================================================================

    /// Fetch the profile, member groups and their players and matches, and
    /// apply each through the conflict resolver.
    pub async fn download_all(&self) -> Result<DownloadReport> {
        let user_id = self.inner.session.current_user_id().ok_or(SyncError::NotSignedIn)?;
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        let remote = &self.inner.remote;
        let mut report = DownloadReport::default();

        if let Some(document) = remote.read(EntityType::User.collection(), &user_id).await? {
            self.apply_document(EntityType::User, document, &mut report).await;
        }

        let group_query = Query::collection(EntityType::Group.collection()).array_contains("members", user_id.as_str());
        let mut group_ids = BTreeSet::new();
        for document in remote.query_where(&group_query).await? {
            if let Some(id) = document.get("id").and_then(|v| v.as_str()) {
                group_ids.insert(id.to_string());
            }
            self.apply_document(EntityType::Group, document, &mut report).await;
        }
        for record in self.inner.local.get_all(EntityType::Group).await? {
            group_ids.insert(record.id().clone());
        }

        for group_id in group_ids {
            if self.inner.lifecycle.is_tombstoned(&group_id).await {
                continue;
            }
            for entity in [EntityType::Player, EntityType::Match] {
                let query = Query::collection(entity.collection()).where_eq("groupId", group_id.as_str());
                for document in remote.query_where(&query).await? {
                    self.apply_document(entity, document, &mut report).await;
                }
            }
        }

        tracing::info!(
            applied = report.applied,
            unchanged = report.unchanged,
            ignored = report.ignored,
            written_back = report.written_back,
            failed = report.failed,
            "Comprehensive download finished"
        );
        if report.failed == 0 {
            let now = self.inner.clock.now();
            self.inner.status.update(|s| s.mark_synced(now)).await;
        }
        Ok(report)
    }

    async fn apply_document(&self, entity: EntityType, document: serde_json::Value, report: &mut DownloadReport) {
        let applied = match Record::from_document(entity, document) {
            Ok(record) => self.inner.replicator.apply_remote_record(record).await,
            Err(e) => Err(e.into()),
        };
        match applied {
            Ok(outcome) => report.count(outcome),
            Err(e) => {
                tracing::warn!(entity = %entity, error = %e, "Skipping remote document");
                report.failed += 1;
            }
        }
    }

    /// Purge local data of deleted groups and revalidate the selection.
    pub async fn consistency_audit(&self) -> Result<AuditReport> {
        self.inner.lifecycle.audit().await
    }

    // ========================================================================
    // Local edits
    // ========================================================================

    /// Save a user profile locally, queue it and announce it.
    pub async fn auto_sync_user(&self, user: User) -> Result<OperationId> {
        self.auto_sync(Record::User(user)).await
    }

    /// Save a group locally, queue it and announce it.
    ///
    /// The invite code is normalized and must not be used by another group.
    pub async fn auto_sync_group(&self, mut group: Group) -> Result<OperationId> {
        group.invite_code = normalize_invite_code(&group.invite_code)?;
        if !group.has_member(&group.owner_id) {
            group.members.insert(0, group.owner_id.clone());
        }
        if let Some(existing) = self.inner.local.group_by_invite_code(&group.invite_code).await? {
            if existing.id != group.id {
                return Err(squad_engine::Error::DuplicateInviteCode {
                    code: group.invite_code,
                    group_id: existing.id,
                }
                .into());
            }
        }
        self.auto_sync(Record::Group(group)).await
    }

    pub async fn auto_sync_player(&self, player: Player) -> Result<OperationId> {
        self.auto_sync(Record::Player(player)).await
    }

    pub async fn auto_sync_match(&self, game: Match) -> Result<OperationId> {
        self.auto_sync(Record::Match(game)).await
    }

    async fn auto_sync(&self, mut record: Record) -> Result<OperationId> {
        record.validate()?;
        if let Some(group_id) = record.group_scope() {
            if self.inner.lifecycle.is_tombstoned(group_id).await {
                return Err(squad_engine::Error::GroupDeleted(group_id.clone()).into());
            }
        }

        let entity = record.entity_type();
        let exists = self.inner.local.get(entity, record.id()).await?.is_some();
        record.set_last_modified(self.inner.clock.now());
        self.inner.local.save(record.clone()).await?;

        let kind = if exists {
            OperationKind::Update
        } else {
            OperationKind::Create
        };
        let priority = match entity {
            EntityType::User | EntityType::Group => Priority::High,
            _ => Priority::Normal,
        };
        let outcome = self
            .inner
            .queue
            .enqueue(kind, entity, Some(&record), priority, Origin::Local)
            .await?;
        self.spawn_push(kind, record);
        Ok(outcome.id)
    }

    /// Delete a record locally and remotely.
    ///
    /// Deleting a group tombstones it and cascades to its players and
    /// matches. Returns whether anything was deleted.
    pub async fn delete_record(&self, entity: EntityType, id: &str) -> Result<bool> {
        match entity {
            EntityType::All => Err(squad_engine::Error::invalid_record(id, "cannot delete ALL").into()),
            EntityType::Group => {
                let group = self.inner.local.get(EntityType::Group, id).await?;
                let report = self.mark_deleted(id).await?;
                if let Some(group) = group {
                    self.spawn_push(OperationKind::Delete, group);
                }
                Ok(report.newly_tombstoned)
            }
            _ => {
                let Some(record) = self.inner.local.get(entity, id).await? else {
                    return Ok(false);
                };
                self.inner.local.delete(entity, id).await?;
                self.inner
                    .queue
                    .enqueue(OperationKind::Delete, entity, Some(&record), Priority::Normal, Origin::Local)
                    .await?;
                self.spawn_push(OperationKind::Delete, record);
                Ok(true)
            }
        }
    }

    fn spawn_push(&self, kind: OperationKind, record: Record) {
        let replicator = self.inner.replicator.clone();
        tokio::spawn(async move {
            if let Err(e) = replicator.push_instant_update(kind, &record).await {
                tracing::warn!(record_id = %record.id(), error = %e, "Realtime push skipped");
            }
        });
    }

    // ========================================================================
    // Group lifecycle
    // ========================================================================

    pub async fn set_current_group(&self, group: &Group, user_initiated: bool) -> Result<SelectionChange> {
        self.inner.lifecycle.set_current_group(group, user_initiated).await
    }

    /// The current group among `available`, selecting one if needed.
    pub async fn current_group(&self, available: &[Group]) -> Result<Option<Group>> {
        self.inner.lifecycle.current_group(available).await
    }

    /// Tombstone a group and clean up its data.
    pub async fn mark_deleted(&self, group_id: &str) -> Result<CascadeReport> {
        self.inner.lifecycle.mark_deleted(group_id).await
    }

    pub async fn is_visible(&self, group_id: &str) -> bool {
        self.inner.lifecycle.is_visible(group_id).await
    }

    pub async fn visible_groups(&self, groups: &[Group]) -> Vec<Group> {
        self.inner.lifecycle.visible_groups(groups).await
    }

    /// Visible groups from the local store, ordered by id.
    pub async fn groups(&self) -> Result<Vec<Group>> {
        let mut groups: Vec<Group> = self
            .inner
            .local
            .get_all(EntityType::Group)
            .await?
            .into_iter()
            .filter_map(|record| match record {
                Record::Group(group) => Some(group),
                _ => None,
            })
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(self.visible_groups(&groups).await)
    }

    /// The lifecycle service, for hiding, auditing and emergency undelete.
    pub fn lifecycle(&self) -> &GroupLifecycleManager {
        &self.inner.lifecycle
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    pub fn watch_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.watch()
    }

    pub fn on_sync_status_change(
        &self,
        callback: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status.on_change(callback)
    }

    pub fn on_realtime_update(
        &self,
        entity: EntityType,
        callback: impl Fn(&RealtimeUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.replicator.on_update(entity, callback)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn replicator(&self) -> &RealtimeReplicator {
        &self.inner.replicator
    }

    /// A copy of the pending operations in drain order.
    pub async fn pending_operations(&self) -> Vec<SyncOperation> {
        self.inner.queue.operations().await
    }

    /// Clear the surfaced error list.
    pub async fn clear_errors(&self) {
        self.inner.status.update(SyncStatus::clear_errors).await;
    }

    // ========================================================================
    // Session
    // ========================================================================

    async fn refresh_subscriptions(&self) {
        let user = self.inner.lifecycle.current_user().await;
        let selection = self.inner.lifecycle.selection().await;
        self.inner
            .replicator
            .resubscribe(user.as_deref(), selection.group_id().map(String::as_str))
            .await;
    }

    fn spawn_session_watcher(&self) {
        let weak = self.downgrade();
        let mut auth = self.inner.session.subscribe();
        let mut selection = self.inner.lifecycle.watch_selection();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = auth.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let user = auth.borrow_and_update().clone();
                        let Some(engine) = Self::upgrade(&weak) else { break };
                        match &user {
                            Some(user_id) => tracing::info!(user_id = %user_id, "Signed in"),
                            None => tracing::info!("Signed out"),
                        }
                        if let Err(e) = engine.inner.lifecycle.activate_user(user).await {
                            tracing::error!(error = %e, "Failed to restore group lifecycle");
                        }
                        let _ = selection.borrow_and_update();
                        engine.refresh_subscriptions().await;
                    }
                    changed = selection.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let _ = selection.borrow_and_update();
                        let Some(engine) = Self::upgrade(&weak) else { break };
                        engine.refresh_subscriptions().await;
                    }
                }
            }
        });
        lock(&self.inner.watchers).push(task);
    }

    /// Stop every task and subscription. The queue stays persisted.
    pub async fn shutdown(&self) {
        self.disable_auto_sync().await;
        if let Some(task) = lock(&self.inner.settle_task).take() {
            task.abort();
        }
        for task in lock(&self.inner.watchers).drain(..) {
            task.abort();
        }
        self.inner.replicator.shutdown();
        tracing::info!("Sync engine stopped");
    }
}
