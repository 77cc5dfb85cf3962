use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::{MessageStream, PubSubDriver};
use crate::error::{PubSubError, PubSubResult};

/// Default capacity of each channel's broadcast buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process message broker: the shared medium several
/// [`InMemoryPubSub`] handles publish through.
///
/// Each handle plays the part of one process's connection to a pubsub
/// server, so tests can run several "processes" against one broker.
pub struct InMemoryBroker {
    channels: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Open a new connection handle.
    pub fn connect(self: &Arc<Self>) -> InMemoryPubSub {
        InMemoryPubSub {
            broker: self.clone(),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn receiver(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        if let Some(sender) = self.channels.read().get(channel) {
            return sender.subscribe();
        }
        self.channels
            .write()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to every current receiver; returns how many there were.
    fn route(&self, channel: &str, data: Vec<u8>) -> usize {
        let channels = self.channels.read();
        match channels.get(channel) {
            Some(sender) => sender.send(data).unwrap_or(0),
            None => 0,
        }
    }
}

/// One connection to an [`InMemoryBroker`].
///
/// Every stream gets its own child of the channel's token, so unsubscribing
/// ends exactly the streams handed out before it.
pub struct InMemoryPubSub {
    broker: Arc<InMemoryBroker>,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    closed: AtomicBool,
}

impl InMemoryPubSub {
    fn ensure_open(&self) -> PubSubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubDriver for InMemoryPubSub {
    async fn finalize(&self) -> PubSubResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        for (_, token) in self.subscriptions.lock().drain() {
            token.cancel();
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> PubSubResult<MessageStream> {
        self.ensure_open()?;
        let token = self
            .subscriptions
            .lock()
            .entry(channel.to_string())
            .or_default()
            .child_token();
        let receiver = self.broker.receiver(channel);
        let channel = channel.to_string();
        debug!(channel = %channel, "subscribed");

        let stream = futures::stream::unfold(
            (receiver, token, channel),
            |(mut receiver, token, channel)| async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        received = receiver.recv() => match received {
                            Ok(data) => return Some((data, (receiver, token, channel))),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(channel = %channel, skipped, "subscriber lagged, messages dropped");
                            }
                            Err(RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, channel: &str) -> PubSubResult<()> {
        if let Some(token) = self.subscriptions.lock().remove(channel) {
            token.cancel();
            debug!(channel, "unsubscribed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, data: Vec<u8>) -> PubSubResult<()> {
        self.ensure_open()?;
        let receivers = self.broker.route(channel, data);
        debug!(channel, receivers, "published");
        Ok(())
    }
}
