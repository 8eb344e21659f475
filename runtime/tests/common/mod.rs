//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use squad_engine::{Group, Match, Player};
use squad_runtime::{
    MemoryBackend, MemoryLocalStore, MemoryRemote, MemoryStateStore, MonotonicClock,
    StaticSession, SyncConfig, SyncEngine,
};
use std::sync::Arc;
use std::time::Duration;

pub const USER: &str = "u-1";
pub const EPOCH_MS: u64 = 1_000_000;

/// One device: an engine plus handles on its collaborators.
pub struct Device {
    pub engine: SyncEngine,
    pub local: Arc<MemoryLocalStore>,
    pub remote: Arc<MemoryRemote>,
    pub session: Arc<StaticSession>,
    pub state: Arc<MemoryStateStore>,
}

/// Default configuration without pacing delays.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        database_url: "sqlite::memory:".to_string(),
        inter_operation_delay: Duration::ZERO,
        inbound_item_delay: Duration::ZERO,
        ..SyncConfig::default()
    }
}

pub async fn device(backend: &MemoryBackend) -> Device {
    device_with_state(backend, MemoryStateStore::new_shared()).await
}

/// A signed-in device whose durable state lives in `state`.
pub async fn device_with_state(backend: &MemoryBackend, state: Arc<MemoryStateStore>) -> Device {
    let local = MemoryLocalStore::new_shared();
    let remote = backend.client();
    let session = StaticSession::signed_in(USER);
    let engine = SyncEngine::builder(local.clone(), remote.clone(), session.clone(), state.clone())
        .config(test_config())
        .clock(Arc::new(MonotonicClock::starting_at(EPOCH_MS)))
        .build()
        .await
        .expect("engine builds");
    Device {
        engine,
        local,
        remote,
        session,
        state,
    }
}

/// Let spawned tasks (pushes, feeds, the inbound processor) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn group(id: &str, code: &str) -> Group {
    Group::new(id, format!("Group {id}"), USER, code, 0).expect("valid group")
}

pub fn player(id: &str, group_id: &str, name: &str) -> Player {
    Player {
        id: id.into(),
        group_id: group_id.into(),
        name: name.into(),
        nickname: None,
        active: true,
        last_modified: 0,
    }
}

pub fn game(id: &str, group_id: &str) -> Match {
    Match {
        id: id.into(),
        group_id: group_id.into(),
        played_at: EPOCH_MS,
        team_a: vec!["p-1".into()],
        team_b: vec!["p-2".into()],
        score_a: Some(2),
        score_b: Some(1),
        last_modified: 0,
    }
}
