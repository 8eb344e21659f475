//! Configuration management for the sync runtime.

use squad_engine::{ConflictResolver, RetryPolicy};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// SQLite URL of the durable state store
    pub database_url: String,
    /// Period of the foreground drain timer
    pub foreground_interval: Duration,
    /// Period of the background reconciliation timer
    pub background_interval: Duration,
    /// Operations taken per drain
    pub batch_size: usize,
    /// Attempts before an operation is abandoned. Quota failures bypass it:
    /// one corrective retry, then the operation is abandoned.
    pub max_attempts: u32,
    /// Backoff table, longest last
    pub retry_delays: Vec<Duration>,
    /// Pause between operations inside one drain
    pub inter_operation_delay: Duration,
    /// Wait after coming online before draining
    pub online_settle_delay: Duration,
    /// Wait between clearing the remote cache and the corrective retry
    pub quota_recovery_delay: Duration,
    /// Recency window of the conflict resolver
    pub conflict_window: Duration,
    pub push_max_attempts: u32,
    pub push_base_delay: Duration,
    /// Bound of the in-memory realtime push retry list
    pub retry_list_capacity: usize,
    /// Pause between inbound realtime items
    pub inbound_item_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://squad-sync.db".to_string(),
            foreground_interval: Duration::from_secs(30),
            background_interval: Duration::from_secs(300),
            batch_size: 5,
            max_attempts: 5,
            retry_delays: [1_000, 2_000, 5_000, 10_000, 30_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            inter_operation_delay: Duration::from_millis(100),
            online_settle_delay: Duration::from_millis(2_000),
            quota_recovery_delay: Duration::from_millis(1_000),
            conflict_window: Duration::from_millis(5_000),
            push_max_attempts: 3,
            push_base_delay: Duration::from_millis(500),
            retry_list_capacity: 50,
            inbound_item_delay: Duration::from_millis(50),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retry_delays = match lookup("SQUAD_RETRY_DELAYS_MS") {
            None => defaults.retry_delays,
            Some(raw) => {
                let delays = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                            ConfigError::Invalid {
                                var: "SQUAD_RETRY_DELAYS_MS",
                                value: raw.clone(),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if delays.is_empty() {
                    return Err(ConfigError::EmptyRetryDelays);
                }
                delays
            }
        };

        let config = Self {
            database_url: lookup("SQUAD_DATABASE_URL").unwrap_or(defaults.database_url),
            foreground_interval: secs(&lookup, "SQUAD_SYNC_INTERVAL_SECS", defaults.foreground_interval)?,
            background_interval: secs(&lookup, "SQUAD_BACKGROUND_INTERVAL_SECS", defaults.background_interval)?,
            batch_size: parse(&lookup, "SQUAD_BATCH_SIZE", defaults.batch_size)?,
            max_attempts: parse(&lookup, "SQUAD_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_delays,
            inter_operation_delay: millis(&lookup, "SQUAD_INTER_OP_DELAY_MS", defaults.inter_operation_delay)?,
            online_settle_delay: millis(&lookup, "SQUAD_ONLINE_SETTLE_MS", defaults.online_settle_delay)?,
            quota_recovery_delay: millis(&lookup, "SQUAD_QUOTA_RECOVERY_MS", defaults.quota_recovery_delay)?,
            conflict_window: millis(&lookup, "SQUAD_CONFLICT_WINDOW_MS", defaults.conflict_window)?,
            push_max_attempts: parse(&lookup, "SQUAD_PUSH_MAX_ATTEMPTS", defaults.push_max_attempts)?,
            push_base_delay: millis(&lookup, "SQUAD_PUSH_BASE_DELAY_MS", defaults.push_base_delay)?,
            retry_list_capacity: parse(&lookup, "SQUAD_RETRY_LIST_CAPACITY", defaults.retry_list_capacity)?,
            inbound_item_delay: millis(&lookup, "SQUAD_INBOUND_DELAY_MS", defaults.inbound_item_delay)?,
        };

        if config.batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "SQUAD_BATCH_SIZE",
                value: "0".into(),
            });
        }
        Ok(config)
    }

    /// The queue's retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            delays_ms: self
                .retry_delays
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect(),
        }
    }

    /// A conflict resolver with the configured window.
    pub fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.conflict_window.as_millis() as u64)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse(lookup, var, default.as_secs()).map(Duration::from_secs)
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse(lookup, var, default.as_millis() as u64).map(Duration::from_millis)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },

    #[error("SQUAD_RETRY_DELAYS_MS must list at least one delay")]
    EmptyRetryDelays,
}
