//! Queue draining, retry and network-transition tests for the sync engine.
//!
//! Every test runs against an in-memory backend with paused tokio time, so
//! retry backoff and settle delays elapse instantly and deterministically.

mod common;

use common::{device, device_with_state, game, group, player, settle, test_config, USER};
use squad_engine::{EntityType, OperationKind, Record};
use squad_runtime::db::keys;
use squad_runtime::{
    LocalStore, MemoryBackend, MemoryLocalStore, MemoryStateStore, RemoteError, SkipReason,
    SqliteStateStore, StateStore, StaticSession, SyncEngine, SyncError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn name_of(document: &serde_json::Value) -> &str {
    document["name"].as_str().unwrap_or_default()
}

#[cfg(test)]
mod drain_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_edit_is_saved_locally_and_drained() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        assert!(device.local.get(EntityType::Player, "p-1").await.unwrap().is_some());
        assert_eq!(device.engine.sync_status().pending_operations, 1);

        let report = device.engine.drain(false).await;
        assert_eq!(report.succeeded, 1);
        assert!(report.is_clean());

        let document = backend.document("players", "p-1").unwrap();
        assert_eq!(name_of(&document), "Ada");
        let status = device.engine.sync_status();
        assert_eq!(status.pending_operations, 0);
        assert!(status.last_sync_time.is_some());
        assert_eq!(status.sync_progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_skips_when_disabled_or_empty() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;

        let report = device.engine.drain(false).await;
        assert_eq!(report.skipped, Some(SkipReason::Disabled));

        device.engine.enable_auto_sync().await;
        settle().await;
        let report = device.engine.drain(false).await;
        assert_eq!(report.skipped, Some(SkipReason::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_edit_drains_without_waiting_for_timer() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_group(group("g-1", "abcd")).await.unwrap();
        settle().await;

        assert!(backend.document("groups", "g-1").is_some());
        assert_eq!(device.engine.sync_status().pending_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_sync_requires_enabled_and_online() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;

        assert!(matches!(device.engine.force_sync_now().await, Err(SyncError::Disabled)));

        device.engine.enable_auto_sync().await;
        device.engine.set_online(false).await;
        assert!(matches!(device.engine.force_sync_now().await, Err(SyncError::Offline)));

        device.engine.set_online(true).await;
        assert!(device.engine.force_sync_now().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_listeners_see_progress() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _subscription = device.engine.on_sync_status_change(move |status| {
            if status.pending_operations > 0 {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        settle().await;

        assert!(seen.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_operation_leaves_remote_unchanged() {
        let backend = MemoryBackend::new();
        let state = MemoryStateStore::new_shared();
        let first = device_with_state(&backend, state.clone()).await;
        first.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        settle().await;
        // The queue as persisted before the write was acknowledged.
        let unacknowledged = state.load(keys::QUEUE).await.unwrap().unwrap();

        first.engine.enable_auto_sync().await;
        settle().await;
        assert!(first.engine.pending_operations().await.is_empty());
        let applied = backend.document("players", "p-1").unwrap();
        first.engine.shutdown().await;
        drop(first);

        // Restart as if the acknowledgement never reached disk.
        state.save(keys::QUEUE, &unacknowledged).await.unwrap();
        let second = device_with_state(&backend, state).await;
        assert_eq!(second.engine.pending_operations().await.len(), 1);
        second.engine.enable_auto_sync().await;
        settle().await;

        assert!(second.engine.pending_operations().await.is_empty());
        assert_eq!(backend.document("players", "p-1"), Some(applied));
        assert_eq!(backend.documents("players").len(), 1);
        assert!(second.engine.sync_status().errors.is_empty());
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_surfaces_one_error() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.remote.fail_always(Some(RemoteError::Timeout));
        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        let first = device.engine.drain(false).await;
        assert_eq!(first.retried, 1);

        // 1s + 2s + 5s + 10s of backoff covers the remaining four attempts.
        tokio::time::sleep(Duration::from_secs(25)).await;

        let status = device.engine.sync_status();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.errors.len(), 1);
        assert!(status.errors[0].starts_with("CREATE PLAYER p-1"));
        assert!(device.engine.pending_operations().await.is_empty());
        assert!(backend.document("players", "p-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_on_retry() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        settle().await;
        device.remote.fail_next(1, RemoteError::Unavailable("flaky".into()));

        let report = device.engine.drain(false).await;
        assert_eq!(report.retried, 1);
        let pending = device.engine.pending_operations().await;
        assert_eq!(pending[0].attempts, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(backend.document("players", "p-1").is_some());
        let status = device.engine.sync_status();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exceeded_clears_cache_and_retries_once() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        settle().await;
        device.remote.fail_next(1, RemoteError::QuotaExceeded("storage".into()));

        let report = device.engine.drain(false).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(device.remote.cache_clear_count(), 1);
        assert!(backend.document("players", "p-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_recovery_failure_abandons_operation() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        settle().await;
        device.remote.fail_next(2, RemoteError::QuotaExceeded("storage".into()));

        let report = device.engine.drain(false).await;
        assert_eq!(report.abandoned, 1);

        let status = device.engine.sync_status();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.errors.len(), 1);
        assert!(status.errors[0].contains("quota recovery failed"));

        device.engine.clear_errors().await;
        assert!(device.engine.sync_status().errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseding_edit_replaces_retrying_operation() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        assert_eq!(device.engine.drain(false).await.succeeded, 1);

        device.remote.fail_always(Some(RemoteError::Timeout));
        device.engine.auto_sync_player(player("p-1", "g-1", "Bea")).await.unwrap();
        assert_eq!(device.engine.drain(false).await.retried, 1);

        device.remote.fail_always(None);
        device.engine.auto_sync_player(player("p-1", "g-1", "Cat")).await.unwrap();

        let pending = device.engine.pending_operations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Update);
        assert_eq!(pending[0].attempts, 0);

        assert_eq!(device.engine.drain(false).await.succeeded, 1);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(name_of(&backend.document("players", "p-1").unwrap()), "Cat");
        assert!(device.engine.sync_status().errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_retrying_update() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        assert_eq!(device.engine.drain(false).await.succeeded, 1);

        device.engine.auto_sync_player(player("p-1", "g-1", "Bea")).await.unwrap();
        settle().await;
        device.remote.fail_next(1, RemoteError::Timeout);
        assert_eq!(device.engine.drain(false).await.retried, 1);

        assert!(device.engine.delete_record(EntityType::Player, "p-1").await.unwrap());
        let pending = device.engine.pending_operations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OperationKind::Delete);

        settle().await;
        assert_eq!(device.engine.drain(false).await.succeeded, 1);
        assert!(backend.document("players", "p-1").is_none());

        // Past the update's backoff: nothing writes the player back.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(backend.document("players", "p-1").is_none());
        device.engine.download_all().await.unwrap();
        assert!(device.local.get(EntityType::Player, "p-1").await.unwrap().is_none());
        assert!(device.engine.pending_operations().await.is_empty());
    }
}

#[cfg(test)]
mod network_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_offline_edits_sync_after_settle_delay() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.enable_auto_sync().await;
        settle().await;

        device.engine.set_online(false).await;
        device.engine.auto_sync_group(group("g-1", "abcd")).await.unwrap();
        device.engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        device.engine.auto_sync_player(player("p-2", "g-1", "Bea")).await.unwrap();

        assert_eq!(device.engine.drain(false).await.skipped, Some(SkipReason::Offline));
        assert_eq!(device.engine.sync_status().pending_operations, 3);
        assert!(backend.document("groups", "g-1").is_none());

        // Another device recorded a match meanwhile.
        let remote_match = Record::Match(game("m-1", "g-1")).with_last_modified(common::EPOCH_MS);
        backend.seed("matches", "m-1", remote_match.to_document());

        device.engine.set_online(true).await;
        settle().await;
        assert!(backend.document("players", "p-1").is_none(), "settle delay not honored");

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(backend.document("groups", "g-1").is_some());
        assert!(backend.document("players", "p-1").is_some());
        assert!(backend.document("players", "p-2").is_some());
        assert!(device.local.get(EntityType::Match, "m-1").await.unwrap().is_some());
        assert_eq!(device.engine.sync_status().pending_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_watch_drives_online_state() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        let (network_tx, network_rx) = tokio::sync::watch::channel(true);
        device.engine.watch_network(network_rx);

        network_tx.send_replace(false);
        settle().await;
        assert!(!device.engine.is_online());
        assert!(!device.remote.is_online());
        assert!(!device.engine.sync_status().online);

        network_tx.send_replace(true);
        settle().await;
        assert!(device.engine.is_online());
    }
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_invite_codes_are_normalized_and_unique() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;

        let mut first = group("g-1", "abcd");
        first.invite_code = " abcd ".into();
        device.engine.auto_sync_group(first).await.unwrap();
        let stored = device.local.get(EntityType::Group, "g-1").await.unwrap().unwrap();
        assert_eq!(stored.as_group().unwrap().invite_code, "ABCD");

        let mut second = group("g-2", "wxyz");
        second.invite_code = "AbCd".into();
        let err = device.engine.auto_sync_group(second).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Engine(squad_engine::Error::DuplicateInviteCode { .. })
        ));

        // Re-saving the owner of the code is fine.
        device.engine.auto_sync_group(group("g-1", "abcd")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_to_deleted_group_are_rejected() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;
        device.engine.auto_sync_group(group("g-1", "abcd")).await.unwrap();
        device.engine.mark_deleted("g-1").await.unwrap();

        let err = device
            .engine
            .auto_sync_player(player("p-1", "g-1", "Ada"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Engine(squad_engine::Error::GroupDeleted(ref id)) if id == "g-1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_record_is_rejected_before_queueing() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;

        let result = device.engine.auto_sync_player(player("p-1", "", "Ada")).await;
        assert!(matches!(result, Err(SyncError::Engine(_))));
        assert!(device.engine.pending_operations().await.is_empty());
        assert!(device.local.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_missing_record_is_a_no_op() {
        let backend = MemoryBackend::new();
        let device = device(&backend).await;

        assert!(!device.engine.delete_record(EntityType::Player, "nope").await.unwrap());
        assert!(device.engine.delete_record(EntityType::All, "x").await.is_err());
    }
}

#[cfg(test)]
mod durability_tests {
    use super::*;

    async fn sqlite_device(url: &str, local: Arc<MemoryLocalStore>) -> (SyncEngine, Arc<SqliteStateStore>) {
        let state = Arc::new(SqliteStateStore::connect(url).await.unwrap());
        let engine = SyncEngine::builder(
            local,
            MemoryBackend::new().client(),
            StaticSession::signed_in(USER),
            state.clone(),
        )
        .config(test_config())
        .online(false)
        .build()
        .await
        .unwrap();
        (engine, state)
    }

    #[tokio::test]
    async fn test_queue_and_device_id_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sync.db").display());
        let local = MemoryLocalStore::new_shared();

        let (engine, state) = sqlite_device(&url, local.clone()).await;
        engine.auto_sync_group(group("g-1", "abcd")).await.unwrap();
        engine.auto_sync_player(player("p-1", "g-1", "Ada")).await.unwrap();
        engine.auto_sync_player(player("p-2", "g-1", "Bea")).await.unwrap();
        engine.mark_deleted("g-9").await.unwrap();

        let before = engine.pending_operations().await;
        let device_id = engine.device_id().clone();
        engine.shutdown().await;
        drop(engine);
        state.pool().close().await;

        let (engine, _state) = sqlite_device(&url, local).await;
        assert_eq!(engine.pending_operations().await, before);
        assert_eq!(engine.device_id(), &device_id);
        assert_eq!(engine.sync_status().pending_operations, before.len());
        assert!(engine.lifecycle().is_tombstoned("g-9").await);
    }
}
