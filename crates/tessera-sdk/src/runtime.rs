use std::future::Future;
use std::sync::Arc;

use tessera_cache::{CacheKeys, CacheLayer};
use tessera_pubsub::InvalidationBus;
use tessera_store::{ObjectStore, RetryPolicy, SqlObjectStore, TransactionManager};
use tracing::{debug, info, warn};

use crate::config::TesseraConfig;
use crate::error::{SdkError, SdkResult};
use crate::registry::DriverRegistry;
use crate::session::Session;

/// Everything one process needs to talk to a Tessera database: the store,
/// the invalidation bus (if configured) and the cache.
pub struct Runtime {
    config: TesseraConfig,
    store: Arc<SqlObjectStore>,
    bus: Option<Arc<InvalidationBus>>,
    cache: Arc<CacheLayer>,
    keys: CacheKeys,
    retry: RetryPolicy,
}

impl Runtime {
    /// Resolve drivers, open the store and wire the cache to the bus.
    pub async fn start(config: TesseraConfig, registry: &DriverRegistry) -> SdkResult<Self> {
        if config.cache.updates_channel.is_some() && config.pubsub.driver.is_none() {
            return Err(SdkError::Configuration(
                "cache.updates_channel requires a pubsub driver".into(),
            ));
        }
        let remote = config
            .cache
            .driver
            .as_deref()
            .map(|key| registry.cache_driver(key))
            .transpose()?;
        let pubsub = config
            .pubsub
            .driver
            .as_deref()
            .map(|key| registry.pubsub_driver(key))
            .transpose()?;

        let store = Arc::new(SqlObjectStore::new(config.storage.clone())?);
        store.initialize().await?;

        let wired = async {
            let bus = match pubsub {
                Some(driver) => {
                    let bus = Arc::new(InvalidationBus::new(driver));
                    bus.initialize().await?;
                    Some(bus)
                }
                None => None,
            };
            let cache = Arc::new(CacheLayer::new(config.cache.clone(), remote, bus.clone())?);
            cache.initialize().await?;
            Ok::<_, SdkError>((bus, cache))
        }
        .await;
        let (bus, cache) = match wired {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(e) = store.finalize().await {
                    warn!(error = %e, "failed to close store after startup error");
                }
                return Err(err);
            }
        };

        info!(
            name = %config.storage.name,
            remote_cache = config.cache.driver.is_some(),
            bus = bus.is_some(),
            "runtime started"
        );
        Ok(Self {
            keys: CacheKeys::new(config.storage.name.clone()),
            config,
            store,
            bus,
            cache,
            retry: RetryPolicy::default(),
        })
    }

    /// Retry policy shared by [`Runtime::run`] and
    /// [`Runtime::transaction_manager`].
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqlObjectStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn bus(&self) -> Option<&Arc<InvalidationBus>> {
        self.bus.as_ref()
    }

    pub fn cache_keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// Uncached transaction retries over the raw store.
    pub fn transaction_manager(&self) -> TransactionManager {
        let store: Arc<dyn ObjectStore> = self.store.clone();
        TransactionManager::new(store).with_policy(self.retry)
    }

    pub async fn session(&self, read_only: bool) -> SdkResult<Session> {
        // Taken before the snapshot opens, so any invalidation the snapshot
        // might not reflect counts as newer.
        let generation = self.cache.generation();
        let txn = self.store.begin(read_only).await?;
        let store: Arc<dyn ObjectStore> = self.store.clone();
        Ok(Session::new(
            store,
            self.cache.clone(),
            self.keys.clone(),
            txn,
            generation,
        ))
    }

    /// Run `work` in a writable session and commit it, retrying the whole
    /// unit on retryable store errors.
    pub async fn run<T, F, Fut>(&self, mut work: F) -> SdkResult<T>
    where
        F: FnMut(Arc<Session>) -> Fut,
        Fut: Future<Output = SdkResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let session = Arc::new(self.session(false).await?);
            let outcome = match work(session.clone()).await {
                Ok(value) => session.commit().await.map(|_| value),
                Err(err) => {
                    if let Err(abort_err) = session.abort().await {
                        debug!(error = %abort_err, "abort after failed unit of work");
                    }
                    Err(err)
                }
            };
            match outcome {
                Err(err) if err.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying session");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Finalize the cache, then the bus, then the store.
    pub async fn shutdown(&self) -> SdkResult<()> {
        self.cache.finalize().await;
        if let Some(bus) = &self.bus {
            bus.finalize().await;
        }
        self.store.finalize().await?;
        info!(name = %self.config.storage.name, "runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tessera_store::StoreError;
    use tessera_types::{Oid, Tid, WriteRequest};

    use super::*;
    use crate::registry::MEMORY_DRIVER;

    fn oid(s: &str) -> Oid {
        Oid::new(s).unwrap()
    }

    fn config(dir: &tempfile::TempDir) -> TesseraConfig {
        let mut config = TesseraConfig::default();
        config.storage.dsn = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("tessera.db").display()
        );
        config.storage.pool_size = 4;
        config
    }

    fn shared_config(dir: &tempfile::TempDir) -> TesseraConfig {
        let mut config = config(dir);
        config.cache.updates_channel = Some("inval".into());
        config.cache.driver = Some(MEMORY_DRIVER.into());
        config.pubsub.driver = Some(MEMORY_DRIVER.into());
        config
    }

    async fn seed(runtime: &Runtime) {
        let session = runtime.session(false).await.unwrap();
        session
            .write(&oid("root"), None, &WriteRequest::root("root", "Folder"))
            .await
            .unwrap();
        session
            .write(
                &oid("doc1"),
                None,
                &WriteRequest::child(oid("root"), "doc1", "Item").with_state(b"v1".to_vec()),
            )
            .await
            .unwrap();
        session.commit().await.unwrap();
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..50 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn channel_without_pubsub_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.cache.updates_channel = Some("inval".into());
        let err = Runtime::start(config, &DriverRegistry::new()).await.err();
        assert!(matches!(err, Some(SdkError::Configuration(_))));
    }

    #[tokio::test]
    async fn unknown_driver_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.cache.driver = Some("redis".into());
        let err = Runtime::start(config, &DriverRegistry::new()).await.err();
        assert!(matches!(err, Some(SdkError::Configuration(_))));
    }

    #[tokio::test]
    async fn reads_go_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::start(config(&dir), &DriverRegistry::new()).await.unwrap();
        seed(&runtime).await;

        let session = runtime.session(true).await.unwrap();
        let first = session.get(&oid("doc1")).await.unwrap();
        let before = runtime.cache().stats().await.local;
        let second = session.get(&oid("doc1")).await.unwrap();
        let after = runtime.cache().stats().await.local;
        assert_eq!(first, second);
        assert_eq!(after.hits, before.hits + 1);

        assert_eq!(session.keys(&oid("root")).await.unwrap(), vec!["doc1"]);
        assert_eq!(session.len(&oid("root")).await.unwrap(), 1);
        assert!(session.contains(&oid("root"), "doc1").await.unwrap());
        assert!(!session.contains(&oid("root"), "nope").await.unwrap());
        let key = runtime.cache_keys().len(&oid("root"));
        assert!(runtime.cache().get(&key).await.is_some());
        session.abort().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn own_writes_are_not_cached_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::start(config(&dir), &DriverRegistry::new()).await.unwrap();
        seed(&runtime).await;

        let session = runtime.session(false).await.unwrap();
        let current = session.get(&oid("doc1")).await.unwrap();
        let writer = WriteRequest::child(oid("root"), "doc1", "Item").with_state(b"v2".to_vec());
        session
            .write(&oid("doc1"), Some(current.tid), &writer)
            .await
            .unwrap();
        // The session sees its own write; the cache still holds committed state.
        assert_eq!(session.get(&oid("doc1")).await.unwrap().state, b"v2".to_vec());
        let key = runtime.cache_keys().object(&oid("doc1"));
        let cached = runtime.cache().get(&key).await.unwrap();
        assert_eq!(cached.as_record().unwrap().state, b"v1".to_vec());

        session.commit().await.unwrap();
        let cached = runtime.cache().get(&key).await.unwrap();
        assert_eq!(cached.as_record().unwrap().state, b"v2".to_vec());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn adding_a_child_invalidates_listing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::start(config(&dir), &DriverRegistry::new()).await.unwrap();
        seed(&runtime).await;

        let reader = runtime.session(true).await.unwrap();
        assert_eq!(reader.len(&oid("root")).await.unwrap(), 1);
        reader.abort().await.unwrap();

        runtime
            .run(|session| async move {
                let writer = WriteRequest::child(oid("root"), "doc2", "Item");
                session.write(&oid("doc2"), None, &writer).await?;
                Ok(())
            })
            .await
            .unwrap();

        let reader = runtime.session(true).await.unwrap();
        assert_eq!(reader.len(&oid("root")).await.unwrap(), 2);
        assert_eq!(reader.keys(&oid("root")).await.unwrap(), vec!["doc1", "doc2"]);
        reader.abort().await.unwrap();

        runtime
            .run(|session| async move {
                session.delete(&oid("doc2")).await?;
                Ok(())
            })
            .await
            .unwrap();
        let reader = runtime.session(true).await.unwrap();
        assert_eq!(reader.len(&oid("root")).await.unwrap(), 1);
        assert!(matches!(
            reader.get(&oid("doc2")).await,
            Err(SdkError::Store(StoreError::NotFound(_)))
        ));
        reader.abort().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn old_snapshot_does_not_refill_invalidated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::start(config(&dir), &DriverRegistry::new()).await.unwrap();
        seed(&runtime).await;
        let key = runtime.cache_keys().object(&oid("doc1"));

        // The reader's snapshot opens before the delete commits.
        let reader = runtime.session(true).await.unwrap();
        assert_eq!(reader.len(&oid("root")).await.unwrap(), 1);

        runtime
            .run(|session| async move {
                session.delete(&oid("doc1")).await?;
                Ok(())
            })
            .await
            .unwrap();

        // Whatever the old snapshot returns must not reach the cache.
        reader.get(&oid("doc1")).await.ok();
        reader.abort().await.unwrap();
        assert!(runtime.cache().get(&key).await.is_none());

        let fresh = runtime.session(true).await.unwrap();
        assert!(matches!(
            fresh.get(&oid("doc1")).await,
            Err(SdkError::Store(StoreError::NotFound(_)))
        ));
        assert_eq!(fresh.len(&oid("root")).await.unwrap(), 0);
        fresh.abort().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn run_retries_with_the_shared_policy() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::start(config(&dir), &DriverRegistry::new())
            .await
            .unwrap()
            .with_retry_policy(
                RetryPolicy::default()
                    .with_max_attempts(2)
                    .with_backoff(Duration::from_millis(1)),
            );
        assert_eq!(runtime.transaction_manager().policy(), runtime.retry_policy());

        let calls = AtomicU32::new(0);
        let err = runtime
            .run(|_session| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(SdkError::Store(StoreError::TidConflict {
                        oid: oid("doc1"),
                        expected: Tid::new(1),
                    }))
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tid_conflict_evicts_local_entry() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::start(config(&dir), &DriverRegistry::new()).await.unwrap();
        seed(&runtime).await;
        let key = runtime.cache_keys().object(&oid("doc1"));

        let reader = runtime.session(true).await.unwrap();
        let seen = reader.get(&oid("doc1")).await.unwrap().tid;
        reader.abort().await.unwrap();

        let winner = runtime.session(false).await.unwrap();
        let writer = WriteRequest::child(oid("root"), "doc1", "Item").with_state(b"v2".to_vec());
        winner.write(&oid("doc1"), Some(seen), &writer).await.unwrap();
        winner.commit().await.unwrap();
        assert!(runtime.cache().get(&key).await.is_some());

        let loser = runtime.session(false).await.unwrap();
        let writer = WriteRequest::child(oid("root"), "doc1", "Item").with_state(b"v3".to_vec());
        let err = loser.write(&oid("doc1"), Some(seen), &writer).await.unwrap_err();
        assert!(matches!(err, SdkError::Store(StoreError::TidConflict { .. })));
        assert!(err.is_retryable());
        assert!(runtime.cache().get(&key).await.is_none());
        loser.abort().await.unwrap();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn peers_see_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DriverRegistry::new();
        let a = Runtime::start(shared_config(&dir), &registry).await.unwrap();
        let b = Runtime::start(shared_config(&dir), &registry).await.unwrap();
        seed(&a).await;
        let key = a.cache_keys().object(&oid("doc1"));

        // B caches doc1 locally.
        let reader = b.session(true).await.unwrap();
        let seen = reader.get(&oid("doc1")).await.unwrap();
        reader.abort().await.unwrap();

        // A updates it.
        let writer = a.session(false).await.unwrap();
        let request = WriteRequest::child(oid("root"), "doc1", "Item").with_state(b"v2".to_vec());
        let tid = writer.write(&oid("doc1"), Some(seen.tid), &request).await.unwrap();
        writer.commit().await.unwrap();
        assert!(a.cache().is_ignored(tid));
        assert!(!b.cache().is_ignored(tid));

        // B's local entry is replaced by the pushed record.
        let cache = b.cache().clone();
        assert!(
            eventually(|| {
                let cache = cache.clone();
                let key = key.clone();
                async move {
                    cache
                        .get(&key)
                        .await
                        .and_then(|value| value.as_record().map(|r| r.tid))
                        == Some(tid)
                }
            })
            .await
        );
        let reader = b.session(true).await.unwrap();
        assert_eq!(reader.get(&oid("doc1")).await.unwrap().state, b"v2".to_vec());
        reader.abort().await.unwrap();

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
