use std::str::FromStr;
use std::sync::Arc;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{StorageConfig, MIN_POOL_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::recovery::{classify, translate};
use crate::vacuum::VacuumWorker;

/// Handle to the current pool, shared with background workers so a restart
/// is picked up without re-wiring them.
#[derive(Clone, Default)]
pub struct SharedPool(Arc<parking_lot::RwLock<Option<SqlitePool>>>);

impl SharedPool {
    /// The live pool, or [`StoreError::NotInitialized`].
    pub fn current(&self) -> StoreResult<SqlitePool> {
        self.0.read().clone().ok_or(StoreError::NotInitialized)
    }

    fn replace(&self, pool: Option<SqlitePool>) -> Option<SqlitePool> {
        std::mem::replace(&mut *self.0.write(), pool)
    }
}

/// Owns the connection pool, the dedicated read connection and the vacuum
/// worker.
///
/// Lifecycle changes (`initialize`, `restart`, `close`) are serialized by
/// one manager-wide lock. Normal query execution never takes it.
pub struct ConnectionManager {
    config: StorageConfig,
    pool: SharedPool,
    read_conn: Mutex<Option<PoolConnection<Sqlite>>>,
    lifecycle: Mutex<()>,
    vacuum: parking_lot::Mutex<Option<Arc<VacuumWorker>>>,
}

impl ConnectionManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            pool: SharedPool::default(),
            read_conn: Mutex::new(None),
            lifecycle: Mutex::new(()),
            vacuum: parking_lot::Mutex::new(None),
        }
    }

    /// Build the pool, take the read connection out of it and start the
    /// vacuum worker.
    pub async fn initialize(&self) -> StoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let pool = self.connect().await?;
        let conn = pool.acquire().await.map_err(|e| self.translate(e))?;
        *self.read_conn.lock().await = Some(conn);
        self.pool.replace(Some(pool));

        {
            let mut vacuum = self.vacuum.lock();
            if vacuum.is_none() {
                *vacuum = Some(Arc::new(VacuumWorker::start(self.pool.clone())));
            }
        }
        info!(
            pool_size = self.config.effective_pool_size(),
            "connection pool initialized"
        );
        Ok(())
    }

    /// Tear down the pool and the read connection and build both again.
    ///
    /// Closing the old pool waits for checked-out connections only up to
    /// the restart timeout; after that the old pool is abandoned.
    pub async fn restart(&self) -> StoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        warn!("restarting connection pool");
        self.read_conn.lock().await.take();
        if let Some(old) = self.pool.replace(None) {
            if tokio::time::timeout(self.config.restart_timeout(), old.close())
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = self.config.restart_timeout_ms,
                    "timed out closing old pool"
                );
            }
        }

        let pool = self.connect().await?;
        let conn = pool.acquire().await.map_err(|e| self.translate(e))?;
        *self.read_conn.lock().await = Some(conn);
        self.pool.replace(Some(pool));
        info!("connection pool restarted");
        Ok(())
    }

    /// Finalize the vacuum worker, release the read connection and close the
    /// pool.
    pub async fn close(&self) -> StoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let vacuum = self.vacuum.lock().take();
        if let Some(vacuum) = vacuum {
            vacuum
                .finalize(self.config.vacuum_finalize_timeout())
                .await;
        }
        self.read_conn.lock().await.take();
        if let Some(pool) = self.pool.replace(None) {
            if tokio::time::timeout(self.config.restart_timeout(), pool.close())
                .await
                .is_err()
            {
                warn!("timed out closing pool, abandoning open connections");
            }
        }
        info!("connection pool closed");
        Ok(())
    }

    /// The live pool.
    pub fn pool(&self) -> StoreResult<SqlitePool> {
        self.pool.current()
    }

    /// Shared handle to the pool slot.
    pub fn shared_pool(&self) -> SharedPool {
        self.pool.clone()
    }

    pub fn vacuum(&self) -> StoreResult<Arc<VacuumWorker>> {
        self.vacuum.lock().clone().ok_or(StoreError::NotInitialized)
    }

    /// Exclusive access to the dedicated read connection.
    ///
    /// Returns the raw backend error so the caller can run it through the
    /// recovery policy; callers must drop the guard before doing so.
    pub async fn read_conn(&self) -> Result<MappedMutexGuard<'_, SqliteConnection>, sqlx::Error> {
        let guard = self.read_conn.lock().await;
        MutexGuard::try_map(guard, |conn| conn.as_deref_mut()).map_err(|_| sqlx::Error::PoolClosed)
    }

    async fn connect(&self) -> StoreResult<SqlitePool> {
        let options = SqliteConnectOptions::from_str(&self.config.dsn)
            .map_err(|e| StoreError::Configuration(format!("invalid dsn {}: {e}", self.config.dsn)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(self.config.busy_timeout());

        debug!(dsn = %self.config.dsn, "connecting");
        SqlitePoolOptions::new()
            .max_connections(self.config.effective_pool_size())
            .min_connections(MIN_POOL_SIZE)
            .acquire_timeout(self.config.conn_acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| self.translate(e))
    }

    fn translate(&self, err: sqlx::Error) -> StoreError {
        let class = classify(&err);
        translate(err, class, self.config.conn_acquire_timeout())
    }
}
