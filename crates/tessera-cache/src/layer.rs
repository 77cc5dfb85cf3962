use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_pubsub::{InvalidationBus, InvalidationMessage, Subscriber};
use tessera_types::Tid;
use tracing::{debug, info, warn};

use crate::driver::CacheDriver;
use crate::error::{CacheError, CacheResult};
use crate::local::{LocalStats, MemoryCache, DEFAULT_MEMORY_SIZE};
use crate::value::CacheValue;

/// How many of this process's own transaction ids are remembered.
pub const MAX_IGNORED_TIDS: usize = 100;

/// How many recently invalidated keys are tracked one by one. Older ones
/// fold into a single watermark.
pub const MAX_TRACKED_INVALIDATIONS: usize = 10_000;

/// Cache settings, usually read from the `[cache]` section of the config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Byte budget of the local tier.
    pub memory_cache_size: usize,
    /// TTL applied to remote entries.
    pub ttl_secs: u64,
    /// Channel invalidations are published on and received from.
    pub updates_channel: Option<String>,
    /// Registry key of the remote cache driver.
    pub driver: Option<String>,
    /// Values estimated larger than this are never cached.
    pub max_cache_record_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_cache_size: DEFAULT_MEMORY_SIZE,
            ttl_secs: 3600,
            updates_channel: None,
            driver: None,
            max_cache_record_size: 5 * 1024 * 1024,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStats {
    pub local: LocalStats,
    /// Whatever the remote driver reports, if one is configured.
    pub remote: Option<serde_json::Value>,
}

/// Invalidation counter plus the count at which each key last went stale.
struct Invalidations {
    generation: u64,
    floor: u64,
    keys: LruCache<String, u64>,
}

impl Invalidations {
    fn new() -> Self {
        Self {
            generation: 0,
            floor: 0,
            keys: LruCache::unbounded(),
        }
    }

    fn mark<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        self.generation += 1;
        for key in keys {
            self.keys.put(key.clone(), self.generation);
        }
        while self.keys.len() > MAX_TRACKED_INVALIDATIONS {
            match self.keys.pop_lru() {
                Some((_, generation)) => self.floor = self.floor.max(generation),
                None => break,
            }
        }
    }

    fn mark_everything(&mut self) {
        self.generation += 1;
        self.floor = self.generation;
        self.keys.clear();
    }

    fn changed_since(&self, key: &str, generation: u64) -> bool {
        self.floor > generation
            || self
                .keys
                .peek(key)
                .is_some_and(|&stale_at| stale_at > generation)
    }
}

/// Two-tier cache with bus-driven invalidation.
///
/// Reads go to the local LRU first and fall back to the remote driver,
/// repopulating the local tier on a remote hit. Every failure below this
/// type is logged and swallowed: callers see a miss, never an error.
///
/// Each applied invalidation bumps a generation counter. A reader that
/// loaded a value from an older snapshot fills it with
/// [`CacheLayer::set_if_unchanged`], which refuses keys invalidated after
/// the reader's generation.
pub struct CacheLayer {
    settings: CacheSettings,
    uid: String,
    // Lock order: `invalidations` before `local`.
    invalidations: Mutex<Invalidations>,
    local: Mutex<MemoryCache>,
    remote: Option<Arc<dyn CacheDriver>>,
    bus: Option<Arc<InvalidationBus>>,
    ignored_tids: Mutex<VecDeque<Tid>>,
}

impl CacheLayer {
    pub fn new(
        settings: CacheSettings,
        remote: Option<Arc<dyn CacheDriver>>,
        bus: Option<Arc<InvalidationBus>>,
    ) -> CacheResult<Self> {
        if settings.updates_channel.is_some() && bus.is_none() {
            return Err(CacheError::Configuration(
                "updates_channel is set but no pubsub driver is configured".into(),
            ));
        }
        Ok(Self {
            invalidations: Mutex::new(Invalidations::new()),
            local: Mutex::new(MemoryCache::new(settings.memory_cache_size)),
            uid: uuid::Uuid::new_v4().to_string(),
            settings,
            remote,
            bus,
            ignored_tids: Mutex::new(VecDeque::new()),
        })
    }

    /// Local-only cache with default settings.
    pub fn local_only() -> Self {
        Self {
            settings: CacheSettings::default(),
            uid: uuid::Uuid::new_v4().to_string(),
            invalidations: Mutex::new(Invalidations::new()),
            local: Mutex::new(MemoryCache::new(DEFAULT_MEMORY_SIZE)),
            remote: None,
            bus: None,
            ignored_tids: Mutex::new(VecDeque::new()),
        }
    }

    /// Requester id this layer publishes under.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Initialize the remote driver and subscribe to the updates channel.
    pub async fn initialize(self: &Arc<Self>) -> CacheResult<()> {
        if let Some(remote) = &self.remote {
            remote.initialize().await?;
        }
        if let (Some(bus), Some(channel)) = (&self.bus, &self.settings.updates_channel) {
            let listener = Arc::new(Listener(Arc::downgrade(self)));
            bus.subscribe(channel, &self.uid, listener)
                .await
                .map_err(|e| CacheError::Driver(e.to_string()))?;
            info!(channel = %channel, uid = %self.uid, "cache subscribed to invalidations");
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let hit = self.local.lock().get(key);
        if let Some(value) = hit {
            debug!(key, "local cache hit");
            return Some(value);
        }
        let remote = self.remote.as_ref()?;
        let bytes = match remote.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "remote cache get failed");
                return None;
            }
        };
        match CacheValue::from_bytes(&bytes) {
            Ok(value) => {
                debug!(key, "remote cache hit");
                self.local.lock().set(key.to_string(), value.clone());
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "undecodable remote cache value");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: CacheValue) {
        self.set_with_ttl(key, value, self.settings.ttl()).await;
    }

    pub async fn set_with_ttl(&self, key: &str, value: CacheValue, ttl: Duration) {
        self.write_through(key, value, ttl, None).await;
    }

    /// Current invalidation generation. Capture it before opening the
    /// snapshot that later reads will fill the cache from.
    pub fn generation(&self) -> u64 {
        self.invalidations.lock().generation
    }

    /// Whether `key` was invalidated after `generation`.
    pub fn changed_since(&self, key: &str, generation: u64) -> bool {
        self.invalidations.lock().changed_since(key, generation)
    }

    /// Fill `key` unless it was invalidated after `generation`. Returns
    /// whether the value was stored.
    pub async fn set_if_unchanged(&self, key: &str, value: CacheValue, generation: u64) -> bool {
        self.write_through(key, value, self.settings.ttl(), Some(generation))
            .await
    }

    async fn write_through(
        &self,
        key: &str,
        value: CacheValue,
        ttl: Duration,
        since: Option<u64>,
    ) -> bool {
        let size = value.size();
        if size > self.settings.max_cache_record_size {
            debug!(key, size, "value too large to cache");
            return false;
        }
        let encoded = match &self.remote {
            Some(_) => match value.to_bytes() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(key, error = %e, "failed to encode cache value");
                    None
                }
            },
            None => None,
        };
        {
            let invalidations = self.invalidations.lock();
            if let Some(generation) = since {
                if invalidations.changed_since(key, generation) {
                    debug!(key, generation, "not filling key invalidated since the read began");
                    return false;
                }
            }
            self.local.lock().set(key.to_string(), value);
        }
        let (Some(remote), Some(bytes)) = (&self.remote, encoded) else {
            return true;
        };
        if let Err(e) = remote.set(key, bytes, ttl).await {
            warn!(key, error = %e, "remote cache set failed");
            return true;
        }
        // An invalidation that landed during the remote write may have
        // deleted the key before this value arrived.
        if let Some(generation) = since {
            if self.changed_since(key, generation) {
                debug!(key, "withdrawing remote fill overtaken by an invalidation");
                if let Err(e) = remote.delete(key).await {
                    warn!(key, error = %e, "remote cache delete failed");
                }
            }
        }
        true
    }

    pub async fn delete(&self, key: &str) {
        {
            let mut invalidations = self.invalidations.lock();
            invalidations.mark([&key.to_string()]);
            self.local.lock().delete(key);
        }
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(key).await {
                warn!(key, error = %e, "remote cache delete failed");
            }
        }
    }

    pub async fn delete_all(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        self.evict_local(keys);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete_all(keys).await {
                warn!(count = keys.len(), error = %e, "remote cache delete_all failed");
            }
        }
    }

    /// Drop `keys` from the local tier only.
    pub fn evict_local(&self, keys: &[String]) {
        let mut invalidations = self.invalidations.lock();
        invalidations.mark(keys);
        let mut local = self.local.lock();
        for key in keys {
            local.delete(key);
        }
    }

    /// Flush both tiers.
    pub async fn clear(&self) {
        {
            let mut invalidations = self.invalidations.lock();
            invalidations.mark_everything();
            self.local.lock().clear();
        }
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.flush_all().await {
                warn!(error = %e, "remote cache flush failed");
            }
        }
    }

    /// Remember `tid` as committed by this process so its echo is skipped.
    pub fn ignore_tid(&self, tid: Tid) {
        let mut ignored = self.ignored_tids.lock();
        ignored.push_back(tid);
        while ignored.len() > MAX_IGNORED_TIDS {
            ignored.pop_front();
        }
    }

    pub fn is_ignored(&self, tid: Tid) -> bool {
        self.ignored_tids.lock().contains(&tid)
    }

    /// Apply an invalidation received from a peer to the local tier.
    ///
    /// Pushed values replace their keys; every other listed key is evicted.
    pub fn invalidate(&self, message: &InvalidationMessage) {
        if self.is_ignored(message.tid) {
            debug!(tid = %message.tid, "skipping own invalidation");
            return;
        }
        let mut pushed = Vec::with_capacity(message.push.len());
        for (key, raw) in &message.push {
            match CacheValue::from_json(raw.clone()) {
                Ok(value) => pushed.push((key.clone(), value)),
                Err(e) => warn!(key = %key, error = %e, "ignoring undecodable pushed value"),
            }
        }
        let mut invalidations = self.invalidations.lock();
        invalidations.mark(message.keys.iter().chain(message.push.keys()));
        let mut local = self.local.lock();
        for key in &message.keys {
            local.delete(key);
        }
        for (key, value) in pushed {
            if value.size() <= self.settings.max_cache_record_size {
                local.set(key, value);
            } else {
                local.delete(&key);
            }
        }
        debug!(
            tid = %message.tid,
            keys = message.keys.len(),
            pushed = message.push.len(),
            "applied invalidation"
        );
    }

    /// Publish one invalidation message for a committed transaction.
    pub async fn send_invalidation(
        &self,
        tid: Tid,
        keys: Vec<String>,
        push: BTreeMap<String, CacheValue>,
    ) {
        let (Some(bus), Some(channel)) = (&self.bus, &self.settings.updates_channel) else {
            return;
        };
        let mut message = InvalidationMessage::new(tid, keys);
        for (key, value) in push {
            match value.to_json() {
                Ok(json) => {
                    message.push.insert(key, json);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping unencodable push");
                    message.keys.push(key);
                }
            }
        }
        bus.publish(channel, &self.uid, message).await;
    }

    pub async fn stats(&self) -> CacheStats {
        let local = self.local.lock().stats();
        let remote = match &self.remote {
            Some(remote) => match remote.info().await {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(error = %e, "remote cache info failed");
                    None
                }
            },
            None => None,
        };
        CacheStats { local, remote }
    }

    /// Unsubscribe from the updates channel and finalize the remote driver.
    pub async fn finalize(&self) {
        if let (Some(bus), Some(channel)) = (&self.bus, &self.settings.updates_channel) {
            bus.unsubscribe(channel, &self.uid).await;
        }
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.finalize().await {
                warn!(error = %e, "failed to finalize cache driver");
            }
        }
        self.local.lock().clear();
        info!(uid = %self.uid, "cache finalized");
    }
}

struct Listener(Weak<CacheLayer>);

#[async_trait]
impl Subscriber for Listener {
    async fn on_message(&self, message: InvalidationMessage, origin: &str) {
        match self.0.upgrade() {
            Some(layer) => layer.invalidate(&message),
            None => debug!(origin, "cache dropped before invalidation arrived"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_pubsub::InMemoryBroker;

    use super::*;
    use crate::memory::InMemoryCacheDriver;

    fn keys(value: &[&str]) -> CacheValue {
        CacheValue::Keys(value.iter().map(|s| s.to_string()).collect())
    }

    fn shared_settings() -> CacheSettings {
        CacheSettings {
            updates_channel: Some("inval".into()),
            driver: Some("memory".into()),
            ..CacheSettings::default()
        }
    }

    async fn peer(
        broker: &Arc<InMemoryBroker>,
        driver: &Arc<InMemoryCacheDriver>,
    ) -> Arc<CacheLayer> {
        let bus = Arc::new(InvalidationBus::new(Arc::new(broker.connect())));
        let remote: Arc<dyn CacheDriver> = driver.clone();
        let layer = Arc::new(CacheLayer::new(shared_settings(), Some(remote), Some(bus)).unwrap());
        layer.initialize().await.unwrap();
        layer
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn local_has(layer: &CacheLayer, key: &str) -> bool {
        layer.local.lock().contains(key)
    }

    #[test]
    fn channel_without_bus_is_rejected() {
        let settings = CacheSettings {
            updates_channel: Some("inval".into()),
            ..CacheSettings::default()
        };
        assert!(matches!(
            CacheLayer::new(settings, None, None),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn settings_defaults() {
        let settings: CacheSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, CacheSettings::default());
        assert_eq!(settings.memory_cache_size, 209_715_200);
        assert_eq!(settings.ttl(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn local_set_get_delete() {
        let cache = CacheLayer::local_only();
        cache.set("k", CacheValue::Count(3)).await;
        assert_eq!(cache.get("k").await, Some(CacheValue::Count(3)));
        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!((stats.local.hits, stats.local.misses), (1, 1));
        assert!(stats.remote.is_none());
    }

    #[tokio::test]
    async fn oversized_values_are_skipped() {
        let settings = CacheSettings {
            max_cache_record_size: 4,
            ..CacheSettings::default()
        };
        let cache = CacheLayer::new(settings, None, None).unwrap();
        cache.set("big", CacheValue::Bytes(vec![0; 5])).await;
        cache.set("small", CacheValue::Bytes(vec![0; 4])).await;
        assert_eq!(cache.get("big").await, None);
        assert!(cache.get("small").await.is_some());
    }

    #[tokio::test]
    async fn remote_hit_repopulates_local() {
        let driver = Arc::new(InMemoryCacheDriver::new());
        let remote: Arc<dyn CacheDriver> = driver.clone();
        let a = CacheLayer::new(CacheSettings::default(), Some(remote.clone()), None).unwrap();
        let b = CacheLayer::new(CacheSettings::default(), Some(remote), None).unwrap();

        a.set("k", keys(&["x", "y"])).await;
        assert!(!local_has(&b, "k"));
        assert_eq!(b.get("k").await, Some(keys(&["x", "y"])));
        assert!(local_has(&b, "k"));

        b.delete_all(&["k".to_string()]).await;
        assert!(driver.is_empty());
        assert_eq!(b.get("k").await, None);

        a.set("j", CacheValue::Count(1)).await;
        a.clear().await;
        assert!(driver.is_empty());
        assert_eq!(a.get("j").await, None);
    }

    #[tokio::test]
    async fn undecodable_remote_value_is_a_miss() {
        let driver = Arc::new(InMemoryCacheDriver::new());
        driver
            .set("k", vec![0xff; 8], Duration::from_secs(60))
            .await
            .unwrap();
        let remote: Arc<dyn CacheDriver> = driver;
        let cache = CacheLayer::new(CacheSettings::default(), Some(remote), None).unwrap();
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn peers_evict_and_receive_pushes() {
        let broker = InMemoryBroker::new();
        let driver = Arc::new(InMemoryCacheDriver::new());
        let a = peer(&broker, &driver).await;
        let b = peer(&broker, &driver).await;

        b.set("stale", CacheValue::Count(1)).await;
        assert!(local_has(&b, "stale"));

        let push = BTreeMap::from([("fresh".to_string(), keys(&["n"]))]);
        a.send_invalidation(Tid::new(10), vec!["stale".into()], push)
            .await;

        assert!(eventually(|| !local_has(&b, "stale")).await);
        assert!(eventually(|| local_has(&b, "fresh")).await);
        assert_eq!(b.get("fresh").await, Some(keys(&["n"])));
        // The sender does not apply its own message.
        assert!(!local_has(&a, "fresh"));
    }

    #[tokio::test]
    async fn ignored_tids_are_skipped() {
        let cache = CacheLayer::local_only();
        cache.set("k", CacheValue::Count(1)).await;
        cache.ignore_tid(Tid::new(5));

        cache.invalidate(&InvalidationMessage::new(Tid::new(5), vec!["k".into()]));
        assert!(local_has(&cache, "k"));

        cache.invalidate(&InvalidationMessage::new(Tid::new(6), vec!["k".into()]));
        assert!(!local_has(&cache, "k"));
    }

    #[test]
    fn ignored_tids_are_bounded() {
        let cache = CacheLayer::local_only();
        for tid in 0..(MAX_IGNORED_TIDS as i64 + 10) {
            cache.ignore_tid(Tid::new(tid));
        }
        assert!(!cache.is_ignored(Tid::new(0)));
        assert!(!cache.is_ignored(Tid::new(9)));
        assert!(cache.is_ignored(Tid::new(10)));
        assert!(cache.is_ignored(Tid::new(MAX_IGNORED_TIDS as i64 + 9)));
    }

    #[tokio::test]
    async fn fills_from_old_reads_are_refused_after_invalidation() {
        let cache = CacheLayer::local_only();
        let before = cache.generation();

        cache.evict_local(&["doc".to_string()]);
        assert!(cache.changed_since("doc", before));
        assert!(!cache.changed_since("other", before));
        assert!(!cache.set_if_unchanged("doc", CacheValue::Count(1), before).await);
        assert!(!local_has(&cache, "doc"));
        assert!(cache.set_if_unchanged("other", CacheValue::Count(1), before).await);

        // A reader that started after the invalidation may fill.
        let after = cache.generation();
        assert!(cache.set_if_unchanged("doc", CacheValue::Count(2), after).await);
        assert_eq!(cache.get("doc").await, Some(CacheValue::Count(2)));
    }

    #[tokio::test]
    async fn peer_invalidations_block_old_fills() {
        let cache = CacheLayer::local_only();
        let before = cache.generation();
        let mut message = InvalidationMessage::new(Tid::new(3), vec!["gone".into()]);
        message
            .push
            .insert("pushed".into(), CacheValue::Count(9).to_json().unwrap());
        cache.invalidate(&message);

        assert!(!cache.set_if_unchanged("gone", CacheValue::Count(1), before).await);
        assert!(!cache.set_if_unchanged("pushed", CacheValue::Count(1), before).await);
        assert_eq!(cache.get("pushed").await, Some(CacheValue::Count(9)));

        // Own echoes are skipped and bump nothing.
        cache.ignore_tid(Tid::new(4));
        let now = cache.generation();
        cache.invalidate(&InvalidationMessage::new(Tid::new(4), vec!["x".into()]));
        assert_eq!(cache.generation(), now);
    }

    #[tokio::test]
    async fn clear_refuses_every_older_fill() {
        let cache = CacheLayer::local_only();
        let before = cache.generation();
        cache.clear().await;
        assert!(cache.changed_since("anything", before));
        assert!(!cache.set_if_unchanged("anything", CacheValue::Count(1), before).await);
    }

    #[test]
    fn forgotten_invalidations_fold_into_the_watermark() {
        let cache = CacheLayer::local_only();
        let before = cache.generation();
        let keys: Vec<String> = (0..=MAX_TRACKED_INVALIDATIONS).map(|i| format!("k{i}")).collect();
        for key in &keys {
            cache.evict_local(std::slice::from_ref(key));
        }
        // k0 fell out of the tracked set but is still reported as changed.
        assert!(cache.changed_since("k0", before));
        assert!(cache.changed_since("never-seen", before));
        let now = cache.generation();
        assert!(!cache.changed_since("k0", now));
    }

    #[test]
    fn bad_pushes_are_ignored() {
        let cache = CacheLayer::local_only();
        let mut message = InvalidationMessage::new(Tid::new(1), vec![]);
        message
            .push
            .insert("k".into(), serde_json::json!({"kind": "bogus"}));
        cache.invalidate(&message);
        assert!(!local_has(&cache, "k"));
    }

    #[tokio::test]
    async fn finalize_unsubscribes() {
        let broker = InMemoryBroker::new();
        let driver = Arc::new(InMemoryCacheDriver::new());
        let a = peer(&broker, &driver).await;
        let b = peer(&broker, &driver).await;
        b.set("k", CacheValue::Count(1)).await;
        b.finalize().await;

        b.set("k", CacheValue::Count(1)).await;
        a.send_invalidation(Tid::new(2), vec!["k".into()], BTreeMap::new())
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(local_has(&b, "k"));
    }
}
