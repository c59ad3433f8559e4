//! Runtime configuration for the core.
//!
//! Every field has a default, so an empty JSON object is a valid config and
//! callers only spell out the values they want to change.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pool sizing and lifetime policy applied to every opened handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    /// Maximum open connections in a shared handle.
    pub max_connections: u32,
    /// Idle floor: connections above this count are reaped once idle.
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout_secs: u64,
    /// Connections older than this are closed and replaced.
    pub max_lifetime_secs: u64,
    /// Idle connections are recycled after this long, before the server
    /// drops them on its side.
    pub idle_timeout_secs: u64,
    /// Upper bound for the liveness probe run on a cached handle.
    pub ping_timeout_secs: u64,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            max_lifetime_secs: 30 * 60,
            idle_timeout_secs: 5 * 60,
            ping_timeout_secs: 5,
        }
    }
}

impl PoolLimits {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

/// Retry policy for opening network connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 4, initial_delay_ms: 1000 }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, initial_delay_ms: 0 }
    }

    /// Delay to sleep before `attempt` (1-based). The first attempt is
    /// immediate.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(16);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor))
    }
}

/// SSH tunnel client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Interval between client keepalive requests.
    pub keepalive_interval_secs: u64,
    /// Unanswered keepalives before the session is considered dead.
    pub keepalive_max: usize,
    /// Timeout for the TCP connect + handshake to the jump host.
    pub connect_timeout_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self { keepalive_interval_secs: 15, keepalive_max: 3, connect_timeout_secs: 15 }
    }
}

/// Locations of the external dump/restore binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupTools {
    pub mysqldump: PathBuf,
    pub mysql: PathBuf,
    pub pg_dump: PathBuf,
    pub psql: PathBuf,
    pub sqlite3: PathBuf,
}

impl Default for BackupTools {
    fn default() -> Self {
        Self {
            mysqldump: PathBuf::from("mysqldump"),
            mysql: PathBuf::from("mysql"),
            pg_dump: PathBuf::from("pg_dump"),
            psql: PathBuf::from("psql"),
            sqlite3: PathBuf::from("sqlite3"),
        }
    }
}

/// Top-level core configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub pool: PoolLimits,
    pub retry: RetryPolicy,
    pub tunnel: TunnelSettings,
    pub backup_tools: BackupTools,
}

impl CoreConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::config(format!("invalid config: {e}")))
    }

    /// Load a JSON config file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(1));
        assert_eq!(policy.delay_before(3), Duration::from_secs(2));
        assert_eq!(policy.delay_before(4), Duration::from_secs(4));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{"pool":{"max_connections":3},"backup_tools":{"pg_dump":"/opt/pg/bin/pg_dump"}}"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_connections, 3);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.backup_tools.pg_dump, PathBuf::from("/opt/pg/bin/pg_dump"));
        assert_eq!(config.backup_tools.psql, PathBuf::from("psql"));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = CoreConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.category(), "Config");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbdeck.json");
        std::fs::write(&path, r#"{"retry":{"max_attempts":2}}"#).unwrap();
        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert!(CoreConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
