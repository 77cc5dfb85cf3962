use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_types::Oid;

use crate::connection::SharedPool;
use crate::error::{StoreError, StoreResult};
use crate::sql::delete_object_sql;

/// One queued physical deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VacuumItem {
    pub oid: Oid,
    pub table: String,
}

/// Background single-consumer queue that hard-deletes trashed objects.
///
/// Each deletion runs in its own spawned task, so cancelling the consumer
/// loop never interrupts a delete halfway through its cascade.
pub struct VacuumWorker {
    sender: mpsc::UnboundedSender<VacuumItem>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    closed: AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl VacuumWorker {
    /// Spawn the consumer loop. Must be called from within a tokio runtime.
    pub fn start(pool: SharedPool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let task = tokio::spawn(consume(receiver, pool, pending.clone(), idle.clone()));
        Self {
            sender,
            pending,
            idle,
            closed: AtomicBool::new(false),
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Queue `oid` for physical deletion from `table`.
    pub fn add_to_queue(&self, oid: Oid, table: impl Into<String>) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::VacuumClosed);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let item = VacuumItem {
            oid,
            table: table.into(),
        };
        if self.sender.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::VacuumClosed);
        }
        Ok(())
    }

    /// Number of queued or in-flight deletions.
    pub fn size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until every queued deletion has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.size() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, wait up to `timeout` for the queue to drain,
    /// then stop the consumer loop.
    pub async fn finalize(&self, timeout: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        if tokio::time::timeout(timeout, self.drain()).await.is_err() {
            warn!(
                remaining = self.size(),
                "vacuum did not drain before shutdown"
            );
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        info!("vacuum worker stopped");
    }
}

impl Drop for VacuumWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn consume(
    mut receiver: mpsc::UnboundedReceiver<VacuumItem>,
    pool: SharedPool,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    while let Some(item) = receiver.recv().await {
        let pool = pool.clone();
        let job = tokio::spawn(async move {
            let result = vacuum_one(&pool, &item).await;
            (item, result)
        });
        match job.await {
            Ok((item, Ok(()))) => debug!(oid = %item.oid, table = %item.table, "vacuumed object"),
            Ok((item, Err(e))) => warn!(oid = %item.oid, error = %e, "failed to vacuum object"),
            Err(e) => warn!(error = %e, "vacuum task failed"),
        }
        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            idle.notify_waiters();
        }
    }
}

async fn vacuum_one(pool: &SharedPool, item: &VacuumItem) -> StoreResult<()> {
    let pool = pool.current()?;
    sqlx::query(&delete_object_sql(&item.table))
        .bind(item.oid.as_str())
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(())
}
