use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_cache::{CacheKeys, CacheLayer, CacheValue, ChangeKind};
use tessera_store::{ObjectStore, StoreError, Transaction};
use tessera_types::{AnnotationKey, ObjectRecord, ObjectWriter, Oid, Tid};
use tracing::debug;

use crate::error::{SdkError, SdkResult};

/// Cache work accumulated by one session until it commits.
#[derive(Default)]
struct Pending {
    keys: BTreeSet<String>,
    push: BTreeMap<String, CacheValue>,
}

/// One transaction plus read-through caching and commit-time invalidation.
///
/// Reads consult the cache first unless this session has written the key
/// itself; its own uncommitted writes are never cached. A miss is filled
/// back into the cache only if no invalidation for that key arrived since
/// the session started, since the session's snapshot may predate it.
/// Writes record the keys they make stale, and [`Session::commit`] applies
/// them to both cache tiers and publishes them to peers.
pub struct Session {
    store: Arc<dyn ObjectStore>,
    cache: Arc<CacheLayer>,
    keys: CacheKeys,
    txn: Transaction,
    generation: u64,
    pending: Mutex<Pending>,
}

impl Session {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<CacheLayer>,
        keys: CacheKeys,
        txn: Transaction,
        generation: u64,
    ) -> Self {
        Self {
            store,
            cache,
            keys,
            txn,
            generation,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    pub fn tid(&self) -> Option<Tid> {
        self.txn.tid()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Keys this session will invalidate on commit.
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.lock().keys.iter().cloned().collect()
    }

    pub async fn get(&self, oid: &Oid) -> SdkResult<ObjectRecord> {
        let key = self.keys.object(oid);
        if let Some(record) = self.cached_record(&key).await {
            return Ok(record);
        }
        let record = self.store.load(&self.txn, oid).await?;
        self.populate(&key, CacheValue::Record(record.clone())).await;
        Ok(record)
    }

    pub async fn get_child(&self, parent: &Oid, id: &str) -> SdkResult<Option<ObjectRecord>> {
        let key = self.keys.child(parent, id);
        if let Some(record) = self.cached_record(&key).await {
            return Ok(Some(record));
        }
        let child = self.store.get_child(&self.txn, parent, id).await?;
        if let Some(record) = &child {
            self.populate(&key, CacheValue::Record(record.clone())).await;
        }
        Ok(child)
    }

    pub async fn contains(&self, parent: &Oid, id: &str) -> SdkResult<bool> {
        Ok(self.get_child(parent, id).await?.is_some())
    }

    /// Child names of `parent`, ordered.
    pub async fn keys(&self, parent: &Oid) -> SdkResult<Vec<String>> {
        let key = self.keys.keys(parent);
        if let Some(CacheValue::Keys(names)) = self.cached(&key).await {
            return Ok(names);
        }
        let names = self.store.keys(&self.txn, parent).await?;
        self.populate(&key, CacheValue::Keys(names.clone())).await;
        Ok(names)
    }

    pub async fn len(&self, parent: &Oid) -> SdkResult<usize> {
        let key = self.keys.len(parent);
        if let Some(CacheValue::Count(count)) = self.cached(&key).await {
            return Ok(count as usize);
        }
        let count = self.store.len(&self.txn, parent).await?;
        self.populate(&key, CacheValue::Count(count as u64)).await;
        Ok(count)
    }

    pub async fn get_annotation(&self, of: &Oid, id: &str) -> SdkResult<Option<ObjectRecord>> {
        let key = self.keys.annotation(of, id);
        if let Some(record) = self.cached_record(&key).await {
            return Ok(Some(record));
        }
        let annotation = self.store.get_annotation(&self.txn, of, id).await?;
        if let Some(record) = &annotation {
            self.populate(&key, CacheValue::Record(record.clone())).await;
        }
        Ok(annotation)
    }

    pub async fn get_annotation_keys(&self, of: &Oid) -> SdkResult<Vec<AnnotationKey>> {
        Ok(self.store.get_annotation_keys(&self.txn, of).await?)
    }

    /// Write `oid` through the store and record what its change invalidates.
    ///
    /// On a [`StoreError::TidConflict`] the keys of the object are evicted
    /// from the local tier straight away, so a retry reloads from the store.
    pub async fn write(
        &self,
        oid: &Oid,
        expected_tid: Option<Tid>,
        writer: &dyn ObjectWriter,
    ) -> SdkResult<Tid> {
        let previous = match expected_tid {
            Some(_) => self.load_optional(oid).await?,
            None => None,
        };
        let tid = match self.store.store(&self.txn, oid, expected_tid, writer).await {
            Ok(tid) => tid,
            Err(err @ StoreError::TidConflict { .. }) => {
                let stale = match &previous {
                    Some(record) => self.keys.keys_for(record, ChangeKind::Modified),
                    None => vec![self.keys.object(oid)],
                };
                debug!(oid = %oid, keys = stale.len(), "evicting keys after tid conflict");
                self.cache.evict_local(&stale);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let record = self.store.load(&self.txn, oid).await?;
        let mut stale = Vec::new();
        match &previous {
            Some(old) if same_place(old, &record) => {
                stale.extend(self.keys.keys_for(&record, ChangeKind::Modified));
            }
            Some(old) => {
                stale.extend(self.keys.keys_for(old, ChangeKind::Deleted));
                stale.extend(self.keys.keys_for(&record, ChangeKind::Added));
            }
            None => stale.extend(self.keys.keys_for(&record, ChangeKind::Added)),
        }
        let object_key = self.keys.object(oid);
        let mut pending = self.pending.lock();
        pending.keys.extend(stale);
        pending.push.insert(object_key, CacheValue::Record(record));
        Ok(tid)
    }

    pub async fn delete(&self, oid: &Oid) -> SdkResult<()> {
        let previous = self.load_optional(oid).await?;
        self.store.delete(&self.txn, oid).await?;
        let stale = match &previous {
            Some(record) => self.keys.keys_for(record, ChangeKind::Deleted),
            None => vec![self.keys.object(oid)],
        };
        let mut pending = self.pending.lock();
        pending.push.remove(&self.keys.object(oid));
        pending.keys.extend(stale);
        Ok(())
    }

    /// Commit, then update both cache tiers and notify peers.
    ///
    /// A failed commit evicts the recorded keys from the local tier and
    /// returns the store error; the caller decides whether to retry.
    pub async fn commit(&self) -> SdkResult<()> {
        let result = self.store.commit(&self.txn).await;
        let pending = std::mem::take(&mut *self.pending.lock());
        let keys: Vec<String> = pending.keys.into_iter().collect();
        if let Err(err) = result {
            self.cache.evict_local(&keys);
            return Err(err.into());
        }
        let Some(tid) = self.txn.tid() else {
            return Ok(());
        };
        if keys.is_empty() && pending.push.is_empty() {
            return Ok(());
        }
        self.cache.ignore_tid(tid);
        self.cache.delete_all(&keys).await;
        for (key, value) in &pending.push {
            self.cache.set(key, value.clone()).await;
        }
        debug!(tid = %tid, keys = keys.len(), pushed = pending.push.len(), "publishing invalidation");
        self.cache.send_invalidation(tid, keys, pending.push).await;
        Ok(())
    }

    /// Roll back and forget recorded cache work.
    pub async fn abort(&self) -> SdkResult<()> {
        *self.pending.lock() = Pending::default();
        self.store.abort(&self.txn).await?;
        Ok(())
    }

    async fn load_optional(&self, oid: &Oid) -> SdkResult<Option<ObjectRecord>> {
        match self.store.load(&self.txn, oid).await {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(SdkError::Store(err)),
        }
    }

    fn written(&self, key: &str) -> bool {
        self.pending.lock().keys.contains(key)
    }

    async fn cached(&self, key: &str) -> Option<CacheValue> {
        if self.written(key) {
            return None;
        }
        self.cache.get(key).await
    }

    async fn cached_record(&self, key: &str) -> Option<ObjectRecord> {
        match self.cached(key).await? {
            CacheValue::Record(record) => Some(record),
            _ => {
                debug!(key, "cached value is not a record");
                None
            }
        }
    }

    async fn populate(&self, key: &str, value: CacheValue) {
        if self.written(key) {
            return;
        }
        if !self.cache.set_if_unchanged(key, value, self.generation).await {
            debug!(key, "read is older than the latest invalidation, not cached");
        }
    }
}

fn same_place(old: &ObjectRecord, new: &ObjectRecord) -> bool {
    old.parent_id == new.parent_id && old.id == new.id && old.of == new.of
}
