use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::PubSubResult;

/// Raw payloads received on one channel.
pub type MessageStream = BoxStream<'static, Vec<u8>>;

/// Transport underneath the [`InvalidationBus`](crate::InvalidationBus).
///
/// Delivery is at-most-once: a driver may drop messages, and the cache
/// treats invalidation as best-effort.
#[async_trait]
pub trait PubSubDriver: Send + Sync {
    async fn initialize(&self) -> PubSubResult<()> {
        Ok(())
    }

    async fn finalize(&self) -> PubSubResult<()> {
        Ok(())
    }

    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> PubSubResult<MessageStream>;

    /// Stop every stream this driver handed out for `channel`.
    async fn unsubscribe(&self, channel: &str) -> PubSubResult<()>;

    async fn publish(&self, channel: &str, data: Vec<u8>) -> PubSubResult<()>;
}
