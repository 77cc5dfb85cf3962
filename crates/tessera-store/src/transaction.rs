use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, SqliteConnection};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use tessera_types::{Oid, Tid};

use crate::error::{StoreError, StoreResult};

/// Callback run once the transaction finishes; receives `true` when the
/// transaction committed.
pub type AfterCommitHook = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// Lifecycle state of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committing,
    Committed,
    Aborted,
    /// Commit validation found conflicting writes.
    Conflict,
}

impl TxnStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Conflict)
    }
}

/// One unit of work against the object store.
///
/// Every backend call of a transaction runs on its own pooled connection,
/// serialized behind an exclusive lock. The database transaction is opened
/// lazily on first use.
pub struct Transaction {
    pool: SqlitePool,
    tid: Option<Tid>,
    read_only: bool,
    db: Mutex<Option<sqlx::Transaction<'static, Sqlite>>>,
    status: parking_lot::Mutex<TxnStatus>,
    modified: parking_lot::Mutex<BTreeSet<Oid>>,
    hooks: parking_lot::Mutex<Vec<AfterCommitHook>>,
}

impl Transaction {
    pub(crate) fn new(pool: SqlitePool, tid: Option<Tid>, read_only: bool) -> Self {
        Self {
            pool,
            tid,
            read_only,
            db: Mutex::new(None),
            status: parking_lot::Mutex::new(TxnStatus::Active),
            modified: parking_lot::Mutex::new(BTreeSet::new()),
            hooks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// TID stamped on every record this transaction writes; `None` for
    /// read-only transactions.
    pub fn tid(&self) -> Option<Tid> {
        self.tid
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn status(&self) -> TxnStatus {
        *self.status.lock()
    }

    /// Existing objects updated by this transaction.
    pub fn modified(&self) -> Vec<Oid> {
        self.modified.lock().iter().cloned().collect()
    }

    /// Register a callback to run when the transaction finishes.
    pub fn add_after_commit_hook<F, Fut>(&self, hook: F)
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks
            .lock()
            .push(Box::new(move |committed| hook(committed).boxed()));
    }

    pub(crate) fn ensure_active(&self) -> StoreResult<()> {
        match self.status() {
            TxnStatus::Active => Ok(()),
            _ => Err(StoreError::TransactionClosed),
        }
    }

    pub(crate) fn mark_modified(&self, oid: Oid) {
        self.modified.lock().insert(oid);
    }

    /// Move from `Active` to `Committing`.
    pub(crate) fn begin_commit(&self) -> StoreResult<()> {
        let mut status = self.status.lock();
        if *status != TxnStatus::Active {
            return Err(StoreError::TransactionClosed);
        }
        *status = TxnStatus::Committing;
        Ok(())
    }

    pub(crate) fn set_status(&self, status: TxnStatus) {
        *self.status.lock() = status;
    }

    /// The transaction's connection, opening the database transaction on
    /// first use.
    pub(crate) async fn conn(&self) -> Result<MappedMutexGuard<'_, SqliteConnection>, sqlx::Error> {
        let mut guard = self.db.lock().await;
        if guard.is_none() {
            *guard = Some(self.pool.begin().await?);
            debug!(tid = ?self.tid, "opened database transaction");
        }
        MutexGuard::try_map(guard, |db| db.as_deref_mut()).map_err(|_| sqlx::Error::PoolClosed)
    }

    pub(crate) async fn commit_db(&self) -> Result<(), sqlx::Error> {
        let db = self.db.lock().await.take();
        match db {
            Some(db) => db.commit().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn rollback_db(&self) -> Result<(), sqlx::Error> {
        let db = self.db.lock().await.take();
        match db {
            Some(db) => db.rollback().await,
            None => Ok(()),
        }
    }

    /// Run and clear the registered hooks.
    pub(crate) async fn run_hooks(&self, committed: bool) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook(committed).await;
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("read_only", &self.read_only)
            .field("status", &self.status())
            .finish()
    }
}
