use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum number of connections kept open by the pool.
pub const MIN_POOL_SIZE: u32 = 2;

/// Configuration for one storage (one object table plus its blob table).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Identifier of this database; prefixes every cache key.
    pub name: String,
    /// SQLite connection string, e.g. `sqlite://data/tessera.db?mode=rwc`.
    pub dsn: String,
    /// Maximum pool size, including the dedicated read connection.
    pub pool_size: u32,
    /// How long a caller waits for a pooled connection before failing.
    pub conn_acquire_timeout_ms: u64,
    /// Bound on closing the old pool during a restart.
    pub restart_timeout_ms: u64,
    /// Minimum time since the last successful connect before a detected
    /// connection loss may trigger another pool restart.
    pub reconnect_delay_ms: u64,
    /// How long SQLite waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
    /// Bound on waiting for queued vacuum work at shutdown.
    pub vacuum_finalize_timeout_ms: u64,
    pub objects_table_name: String,
    pub blobs_table_name: String,
    /// Enqueue deleted objects for vacuuming as soon as the deleting
    /// transaction commits.
    pub autovacuum: bool,
    /// Persist the writer's JSON projection.
    pub store_json: bool,
    pub read_only: bool,
    /// States at or above this size are logged when stored.
    pub large_record_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "db".into(),
            dsn: "sqlite://tessera.db?mode=rwc".into(),
            pool_size: 13,
            conn_acquire_timeout_ms: 20_000,
            restart_timeout_ms: 2_000,
            reconnect_delay_ms: 250,
            busy_timeout_ms: 5_000,
            vacuum_finalize_timeout_ms: 2_000,
            objects_table_name: "objects".into(),
            blobs_table_name: "blobs".into(),
            autovacuum: true,
            store_json: true,
            read_only: false,
            large_record_size: 1 << 24,
        }
    }
}

impl StorageConfig {
    /// A configuration pointing at `dsn` with every other field defaulted.
    pub fn with_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Default::default()
        }
    }

    /// Pool size clamped to [`MIN_POOL_SIZE`].
    pub fn effective_pool_size(&self) -> u32 {
        self.pool_size.max(MIN_POOL_SIZE)
    }

    pub fn conn_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.conn_acquire_timeout_ms)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn vacuum_finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.vacuum_finalize_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StorageConfig::default();
        assert_eq!(c.pool_size, 13);
        assert_eq!(c.conn_acquire_timeout(), Duration::from_secs(20));
        assert_eq!(c.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(c.objects_table_name, "objects");
        assert!(c.autovacuum);
        assert!(!c.read_only);
        assert_eq!(c.large_record_size, 16 * 1024 * 1024);
    }

    #[test]
    fn pool_size_is_clamped() {
        let c = StorageConfig {
            pool_size: 1,
            ..Default::default()
        };
        assert_eq!(c.effective_pool_size(), MIN_POOL_SIZE);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let c: StorageConfig = serde_json::from_str(r#"{"dsn": "sqlite://x.db", "pool_size": 4}"#).unwrap();
        assert_eq!(c.dsn, "sqlite://x.db");
        assert_eq!(c.pool_size, 4);
        assert_eq!(c.blobs_table_name, "blobs");
    }
}
