use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::CacheDriver;
use crate::error::CacheResult;

/// In-memory [`CacheDriver`] with TTL expiry.
///
/// Share one instance (behind an `Arc`) between several cache layers to
/// stand in for a remote cache server.
#[derive(Default)]
pub struct InMemoryCacheDriver {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl InMemoryCacheDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheDriver for InMemoryCacheDriver {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                debug!(key, "expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let expires = Instant::now() + ttl;
        self.entries.lock().insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_all(&self, keys: &[String]) -> CacheResult<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn flush_all(&self) -> CacheResult<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn info(&self) -> CacheResult<serde_json::Value> {
        let entries = self.entries.lock();
        let bytes: usize = entries.values().map(|(value, _)| value.len()).sum();
        Ok(serde_json::json!({
            "driver": "memory",
            "entries": entries.len(),
            "bytes": bytes,
        }))
    }
}
