//! Durable key/value state.
//!
//! Everything the runtime must survive a restart with (the queue snapshot,
//! the status aggregate, the device id and each user's group lifecycle) is
//! stored as a JSON string under a well-known key.

use super::{create_pool, run_migrations, Pool};
use crate::error::StateError;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::Row;
use std::sync::Arc;

/// Well-known state keys.
pub mod keys {
    pub const QUEUE: &str = "sync_queue";
    pub const STATUS: &str = "sync_status";
    pub const DEVICE_ID: &str = "device_id";

    /// Key of one user's group lifecycle state.
    pub fn lifecycle(user_id: &str) -> String {
        format!("group_lifecycle:{user_id}")
    }
}

/// The persistence boundary of the runtime.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, StateError>;

    async fn save(&self, key: &str, value: &str) -> Result<(), StateError>;

    async fn remove(&self, key: &str) -> Result<(), StateError>;
}

/// State stored in the `sync_state` SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: Pool,
}

impl SqliteStateStore {
    /// Open (or create) the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StateError> {
        let pool = create_pool(database_url).await?;
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StateError> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StateError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StateError> {
        sqlx::query("DELETE FROM sync_state WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// State kept in memory, for tests and ephemeral devices.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Synchronous peek, for assertions.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StateError> {
        self.entries.remove(key);
        Ok(())
    }
}
