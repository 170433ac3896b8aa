use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Migration ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding one subdirectory of record files per namespace.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Where the applied set is persisted.
    #[serde(default)]
    pub applied_store: AppliedStoreKind,

    /// Applied-set file, used when `applied_store = "file"`.
    #[serde(default = "default_applied_file")]
    pub applied_file: PathBuf,

    /// Mutual exclusion primitive around a batch.
    #[serde(default)]
    pub lock: LockKind,

    /// Advisory lock key, used when `lock = "advisory"`.
    #[serde(default = "default_lock_id")]
    pub lock_id: i64,

    /// Lock file, used when `lock = "file"`.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// How long to keep polling for a held lock before giving up.
    #[serde(default)]
    pub lock_wait_secs: u64,

    /// Poll interval while waiting for the lock, in milliseconds.
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,

    /// Per-operation timeout; exceeding it aborts the batch.
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
}

impl MigrationsConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            applied_store: AppliedStoreKind::default(),
            applied_file: default_applied_file(),
            lock: LockKind::default(),
            lock_id: default_lock_id(),
            lock_file: default_lock_file(),
            lock_wait_secs: 0,
            lock_poll_ms: default_lock_poll(),
            operation_timeout_secs: None,
        }
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_applied_file() -> PathBuf {
    PathBuf::from("migrations/.applied.json")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("migrations/.strata.lock")
}

fn default_lock_id() -> i64 {
    0x5354524154 // "STRAT" in hex
}

fn default_lock_poll() -> u64 {
    500
}

/// Applied-set persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedStoreKind {
    /// `strata_migrations` table in the target database.
    #[default]
    Database,
    /// JSON file on disk.
    File,
}

/// Lock used around an apply batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// PostgreSQL session advisory lock.
    #[default]
    Advisory,
    /// Exclusive lock file.
    File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrationsConfig::default();
        assert_eq!(config.lock_wait(), Duration::ZERO);
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(500));
        assert!(config.operation_timeout().is_none());
        assert_eq!(config.lock_id, 0x5354524154);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = MigrationsConfig {
            lock_poll_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(1));
    }
}
