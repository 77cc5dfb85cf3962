use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheResult;

/// Shared (remote) cache tier, e.g. a memcached-style server.
///
/// Values are opaque bytes; the [`CacheLayer`](crate::CacheLayer) handles
/// encoding.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    async fn initialize(&self) -> CacheResult<()> {
        Ok(())
    }

    async fn finalize(&self) -> CacheResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn delete_all(&self, keys: &[String]) -> CacheResult<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn flush_all(&self) -> CacheResult<()>;

    /// Driver-specific statistics.
    async fn info(&self) -> CacheResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}
