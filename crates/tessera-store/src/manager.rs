use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::traits::ObjectStore;
use crate::transaction::Transaction;

/// Default number of attempts for one unit of work.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff step between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

/// How often, and how patiently, a failed unit of work is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a retryable failure on `attempt` (1-based) gets another go.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Linear backoff with random jitter of up to one step.
    pub fn delay(&self, attempt: u32) -> Duration {
        let step = self.backoff.as_millis() as u64;
        let jitter = if step == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=step)
        };
        Duration::from_millis(step * u64::from(attempt) + jitter)
    }
}

/// Runs units of work in transactions and owns the retry policy.
///
/// A retryable error anywhere in the unit (or at commit) aborts the
/// transaction and reruns the whole closure in a fresh one.
#[derive(Clone)]
pub struct TransactionManager {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.policy = self.policy.with_max_attempts(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.policy = self.policy.with_backoff(backoff);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Run `work` in a writable transaction, committing on success.
    pub async fn run<T, F, Fut>(&self, mut work: F) -> StoreResult<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = self.attempt(&mut work).await;
            match outcome {
                Err(err) if err.is_retryable() && self.policy.allows_retry(attempt) => {
                    let delay = self.policy.delay(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying transaction");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, work: &mut F) -> StoreResult<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let txn = Arc::new(self.store.begin(false).await?);
        match work(txn.clone()).await {
            Ok(value) => {
                self.store.commit(&txn).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = self.store.abort(&txn).await {
                    debug!(error = %abort_err, "abort after failed unit of work");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tessera_types::{Oid, Tid, WriteRequest};

    use super::*;
    use crate::config::StorageConfig;
    use crate::error::StoreError;
    use crate::storage::SqlObjectStore;

    async fn manager(dir: &tempfile::TempDir) -> TransactionManager {
        let store = SqlObjectStore::new(StorageConfig {
            dsn: format!("sqlite://{}", dir.path().join("m.db").display()),
            autovacuum: false,
            ..Default::default()
        })
        .unwrap();
        store.initialize().await.unwrap();
        TransactionManager::new(Arc::new(store)).with_backoff(Duration::from_millis(1))
    }

    #[test]
    fn delay_grows_linearly_with_bounded_jitter() {
        let policy = RetryPolicy::default().with_backoff(Duration::from_millis(10));
        for attempt in 1..=4u32 {
            let delay = policy.delay(attempt).as_millis() as u64;
            let floor = 10 * u64::from(attempt);
            assert!((floor..=floor + 10).contains(&delay), "attempt {attempt}: {delay}ms");
        }
        let flat = RetryPolicy::default().with_backoff(Duration::ZERO);
        assert_eq!(flat.delay(3), Duration::ZERO);
    }

    #[test]
    fn attempts_are_at_least_one() {
        let policy = RetryPolicy::default().with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.allows_retry(1));
        assert!(RetryPolicy::default().allows_retry(2));
        assert!(!RetryPolicy::default().allows_retry(DEFAULT_MAX_ATTEMPTS));
    }

    #[tokio::test]
    async fn retries_retryable_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let calls = AtomicU32::new(0);

        let tid = manager
            .run(|txn| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                let store = manager.store().clone();
                async move {
                    if attempt == 0 {
                        return Err(StoreError::TidConflict {
                            oid: Oid::new("doc1").unwrap(),
                            expected: Tid::new(1),
                        });
                    }
                    store
                        .store(&txn, &Oid::new("doc1").unwrap(), None, &WriteRequest::root("doc1", "Item"))
                        .await
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let record = manager
            .run(|txn| {
                let store = manager.store().clone();
                async move { store.load(&txn, &Oid::new("doc1").unwrap()).await }
            })
            .await
            .unwrap();
        assert_eq!(record.tid, tid);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await.with_max_attempts(2);
        let calls = AtomicU32::new(0);

        let err = manager
            .run(|_txn| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StoreError::Conflict("busy".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_are_returned_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let calls = AtomicU32::new(0);

        let err = manager
            .run(|_txn| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StoreError::ContainerIdentityConflict { parent_id: None, id: None }) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ContainerIdentityConflict { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
