//! Squad Sync - two-device demo of the offline-first sync runtime.
//!
//! Runs two devices of the same user against a shared in-memory backend.
//! Device A keeps its sync state in SQLite (`SQUAD_DATABASE_URL`), device B
//! in memory. B goes offline, both edit, B comes back, and A finally deletes
//! the group.

use squad_engine::{EntityType, Group, Match, Player};
use squad_runtime::{
    MemoryBackend, MemoryLocalStore, MemoryStateStore, SqliteStateStore, StaticSession,
    SyncConfig, SyncEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USER_ID: &str = "demo-user";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "squad_runtime=debug,squad_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    tracing::info!("Starting two-device sync demo (state: {})", config.database_url);

    let backend = MemoryBackend::new();
    let state_a = Arc::new(SqliteStateStore::connect(&config.database_url).await?);

    let device_a = SyncEngine::builder(
        MemoryLocalStore::new_shared(),
        backend.client(),
        StaticSession::signed_in(USER_ID),
        state_a,
    )
    .config(config.clone())
    .build()
    .await?;

    let device_b = SyncEngine::builder(
        MemoryLocalStore::new_shared(),
        backend.client(),
        StaticSession::signed_in(USER_ID),
        MemoryStateStore::new_shared(),
    )
    .config(config.clone())
    .build()
    .await?;

    let _updates = device_b.on_realtime_update(EntityType::All, |update| {
        tracing::info!(
            target: "squad_sync",
            "device B saw {:?} {} {}",
            update.change,
            update.entity_type,
            update.record_id
        );
    });

    device_a.enable_auto_sync().await;
    device_b.enable_auto_sync().await;

    // Device A creates a group with one player and a match.
    let group = Group::new("grp-demo", "Tuesday Football", USER_ID, "tues42", 0)?;
    device_a.auto_sync_group(group.clone()).await?;
    device_a.set_current_group(&group, true).await?;
    device_a
        .auto_sync_player(Player {
            id: "ply-ada".into(),
            group_id: group.id.clone(),
            name: "Ada".into(),
            nickname: None,
            active: true,
            last_modified: 0,
        })
        .await?;
    device_a.force_sync_now().await?;

    // Device B picks the group up and selects it.
    device_b.force_sync_now().await?;
    for group in device_b.groups().await? {
        device_b.set_current_group(&group, true).await?;
    }

    // B goes offline and keeps editing; A records a match meanwhile.
    device_b.set_online(false).await;
    device_b
        .auto_sync_player(Player {
            id: "ply-bea".into(),
            group_id: group.id.clone(),
            name: "Bea".into(),
            nickname: Some("B".into()),
            active: true,
            last_modified: 0,
        })
        .await?;
    device_a
        .auto_sync_match(Match {
            id: "mtc-1".into(),
            group_id: group.id.clone(),
            played_at: 0,
            team_a: vec!["ply-ada".into()],
            team_b: vec!["ply-bea".into()],
            score_a: Some(3),
            score_b: Some(2),
            last_modified: 0,
        })
        .await?;
    tracing::info!(
        target: "squad_sync",
        "device B offline with {} pending operation(s)",
        device_b.sync_status().pending_operations
    );

    // B comes back; the settle delay elapses, then it drains and downloads.
    device_b.set_online(true).await;
    tokio::time::sleep(config.online_settle_delay + Duration::from_secs(1)).await;
    device_a.force_sync_now().await?;

    for (name, device) in [("A", &device_a), ("B", &device_b)] {
        let status = device.sync_status();
        tracing::info!(
            target: "squad_sync",
            "device {name}: pending={} progress={}% errors={} replicator={:?}",
            status.pending_operations,
            status.sync_progress,
            status.errors.len(),
            device.replicator().stats()
        );
    }

    // A deletes the group; B learns about it through the notification feed.
    device_a.delete_record(EntityType::Group, &group.id).await?;
    device_a.force_sync_now().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!(
        target: "squad_sync",
        "group visible on A: {}, on B: {}",
        device_a.is_visible(&group.id).await,
        device_b.is_visible(&group.id).await
    );

    device_a.shutdown().await;
    device_b.shutdown().await;
    Ok(())
}
