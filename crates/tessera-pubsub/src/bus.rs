use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{MessageStream, PubSubDriver};
use crate::envelope::{Envelope, InvalidationMessage};
use crate::error::PubSubResult;

/// Receiver of invalidation messages published by other requesters.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Called for every message on the channel whose origin is not this
    /// subscriber's requester id.
    async fn on_message(&self, message: InvalidationMessage, origin: &str);
}

type Subscribers = Arc<RwLock<HashMap<String, Arc<dyn Subscriber>>>>;

struct Channel {
    subscribers: Subscribers,
    cancel: CancellationToken,
    relay: JoinHandle<()>,
}

/// Cross-process invalidation bus.
///
/// The first local subscriber on a channel starts one relay task that reads
/// the driver's stream, decodes envelopes and fans them out. The last
/// subscriber to leave stops the relay and unsubscribes from the driver
/// while still holding the channel table, so a concurrent subscribe always
/// opens a fresh stream. A relay whose stream ended is restarted by the
/// next subscribe. Publishing is fire-and-forget.
pub struct InvalidationBus {
    driver: Arc<dyn PubSubDriver>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl InvalidationBus {
    pub fn new(driver: Arc<dyn PubSubDriver>) -> Self {
        Self {
            driver,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn initialize(&self) -> PubSubResult<()> {
        self.driver.initialize().await
    }

    /// Register `subscriber` under `requester_id` on `channel`.
    ///
    /// Registering the same requester id twice replaces the earlier
    /// subscriber.
    pub async fn subscribe(
        &self,
        channel: &str,
        requester_id: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> PubSubResult<()> {
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get_mut(channel) {
            if existing.relay.is_finished() {
                warn!(channel, "relay had stopped, restarting it");
                let stream = self.driver.subscribe(channel).await?;
                existing.cancel = CancellationToken::new();
                existing.relay = tokio::spawn(relay(
                    channel.to_string(),
                    stream,
                    existing.subscribers.clone(),
                    existing.cancel.clone(),
                ));
            }
            existing
                .subscribers
                .write()
                .insert(requester_id.to_string(), subscriber);
            return Ok(());
        }

        let stream = self.driver.subscribe(channel).await?;
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::from([(
            requester_id.to_string(),
            subscriber,
        )])));
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(relay(
            channel.to_string(),
            stream,
            subscribers.clone(),
            cancel.clone(),
        ));
        channels.insert(
            channel.to_string(),
            Channel {
                subscribers,
                cancel,
                relay,
            },
        );
        info!(channel, requester_id, "relay started");
        Ok(())
    }

    /// Remove the subscriber registered under `requester_id`.
    pub async fn unsubscribe(&self, channel: &str, requester_id: &str) {
        let mut channels = self.channels.lock().await;
        let now_empty = match channels.get(channel) {
            Some(state) => {
                let mut subscribers = state.subscribers.write();
                subscribers.remove(requester_id);
                subscribers.is_empty()
            }
            None => return,
        };
        if !now_empty {
            return;
        }
        if let Some(state) = channels.remove(channel) {
            self.stop(channel, state).await;
        }
    }

    /// Wrap `message` in an envelope tagged with `requester_id` and send it.
    /// Failures are logged, never returned.
    pub async fn publish(&self, channel: &str, requester_id: &str, message: InvalidationMessage) {
        let payload = match Envelope::new(requester_id, message).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "failed to encode invalidation");
                return;
            }
        };
        if let Err(e) = self.driver.publish(channel, payload).await {
            warn!(channel, error = %e, "failed to publish invalidation");
        }
    }

    /// Number of local subscribers on `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(channel)
            .map_or(0, |state| state.subscribers.read().len())
    }

    /// Whether a live relay is reading `channel`.
    pub async fn is_relaying(&self, channel: &str) -> bool {
        self.channels
            .lock()
            .await
            .get(channel)
            .is_some_and(|state| !state.relay.is_finished())
    }

    /// Stop every relay and finalize the driver.
    pub async fn finalize(&self) {
        let mut channels = self.channels.lock().await;
        for (name, state) in channels.drain() {
            self.stop(&name, state).await;
        }
        drop(channels);
        if let Err(e) = self.driver.finalize().await {
            warn!(error = %e, "failed to finalize pubsub driver");
        }
        info!("invalidation bus finalized");
    }

    /// Called with the channel table locked.
    async fn stop(&self, channel: &str, state: Channel) {
        state.cancel.cancel();
        if let Err(e) = state.relay.await {
            warn!(channel, error = %e, "relay task failed");
        }
        if let Err(e) = self.driver.unsubscribe(channel).await {
            warn!(channel, error = %e, "failed to unsubscribe");
        }
        debug!(channel, "relay stopped");
    }
}

async fn relay(
    channel: String,
    mut stream: MessageStream,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => match next {
                Some(payload) => dispatch(&channel, &payload, &subscribers).await,
                None => {
                    warn!(channel = %channel, "driver stream ended");
                    return;
                }
            },
        }
    }
}

async fn dispatch(channel: &str, payload: &[u8], subscribers: &Subscribers) {
    let envelope = match Envelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(channel, error = %e, "dropping undecodable message");
            return;
        }
    };
    let targets: Vec<Arc<dyn Subscriber>> = subscribers
        .read()
        .iter()
        .filter(|(id, _)| **id != envelope.origin)
        .map(|(_, subscriber)| subscriber.clone())
        .collect();
    debug!(
        channel,
        origin = %envelope.origin,
        tid = %envelope.data.tid,
        targets = targets.len(),
        "dispatching invalidation"
    );
    for subscriber in targets {
        subscriber
            .on_message(envelope.data.clone(), &envelope.origin)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tessera_types::Tid;
    use tokio::sync::mpsc;

    use super::*;
    use crate::memory::InMemoryBroker;

    struct Recorder(mpsc::UnboundedSender<(InvalidationMessage, String)>);

    #[async_trait]
    impl Subscriber for Recorder {
        async fn on_message(&self, message: InvalidationMessage, origin: &str) {
            let _ = self.0.send((message, origin.to_string()));
        }
    }

    fn recorder() -> (
        Arc<dyn Subscriber>,
        mpsc::UnboundedReceiver<(InvalidationMessage, String)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    fn message(tid: i64) -> InvalidationMessage {
        InvalidationMessage::new(Tid::new(tid), vec![format!("db-doc{tid}")])
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<(InvalidationMessage, String)>,
    ) -> Option<(InvalidationMessage, String)> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn delivers_across_processes() {
        let broker = InMemoryBroker::new();
        let bus_a = InvalidationBus::new(Arc::new(broker.connect()));
        let bus_b = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub_a, mut rx_a) = recorder();
        let (sub_b, mut rx_b) = recorder();
        bus_a.subscribe("inval", "a", sub_a).await.unwrap();
        bus_b.subscribe("inval", "b", sub_b).await.unwrap();

        bus_a.publish("inval", "a", message(7)).await;

        let (received, origin) = recv(&mut rx_b).await.unwrap();
        assert_eq!(received, message(7));
        assert_eq!(origin, "a");
        // The publisher never hears its own message.
        assert!(recv(&mut rx_a).await.is_none());
    }

    #[tokio::test]
    async fn suppresses_own_messages_within_one_process() {
        let broker = InMemoryBroker::new();
        let bus = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub_a, mut rx_a) = recorder();
        let (sub_b, mut rx_b) = recorder();
        bus.subscribe("inval", "a", sub_a).await.unwrap();
        bus.subscribe("inval", "b", sub_b).await.unwrap();
        assert_eq!(bus.subscriber_count("inval").await, 2);

        bus.publish("inval", "a", message(1)).await;
        assert_eq!(recv(&mut rx_b).await.unwrap().0, message(1));
        assert!(recv(&mut rx_a).await.is_none());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let broker = InMemoryBroker::new();
        let raw = broker.connect();
        let bus = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub, mut rx) = recorder();
        bus.subscribe("inval", "a", sub).await.unwrap();

        raw.publish("inval", b"garbage".to_vec()).await.unwrap();
        raw.publish("inval", Envelope::new("z", message(2)).encode().unwrap())
            .await
            .unwrap();

        // The relay survives the bad payload and delivers the next one.
        assert_eq!(recv(&mut rx).await.unwrap().0, message(2));
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_the_relay() {
        let broker = InMemoryBroker::new();
        let bus = InvalidationBus::new(Arc::new(broker.connect()));
        let publisher = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub_a, mut rx_a) = recorder();
        let (sub_b, _rx_b) = recorder();
        bus.subscribe("inval", "a", sub_a).await.unwrap();
        bus.subscribe("inval", "b", sub_b).await.unwrap();

        bus.unsubscribe("inval", "b").await;
        assert_eq!(bus.subscriber_count("inval").await, 1);
        publisher.publish("inval", "p", message(3)).await;
        assert!(recv(&mut rx_a).await.is_some());

        bus.unsubscribe("inval", "a").await;
        assert_eq!(bus.subscriber_count("inval").await, 0);
        publisher.publish("inval", "p", message(4)).await;
        assert!(recv(&mut rx_a).await.is_none());

        // Unknown channels and ids are ignored.
        bus.unsubscribe("inval", "a").await;
        bus.unsubscribe("other", "x").await;
    }

    #[tokio::test]
    async fn resubscribe_racing_the_last_unsubscribe_still_delivers() {
        let broker = InMemoryBroker::new();
        let bus = InvalidationBus::new(Arc::new(broker.connect()));
        let publisher = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub_a, _rx_a) = recorder();
        let (sub_b, mut rx_b) = recorder();
        bus.subscribe("inval", "a", sub_a).await.unwrap();

        let (_, subscribed) = tokio::join!(
            bus.unsubscribe("inval", "a"),
            bus.subscribe("inval", "b", sub_b)
        );
        subscribed.unwrap();
        assert_eq!(bus.subscriber_count("inval").await, 1);
        assert!(bus.is_relaying("inval").await);

        publisher.publish("inval", "p", message(8)).await;
        assert_eq!(recv(&mut rx_b).await.unwrap().0, message(8));
    }

    #[tokio::test]
    async fn ended_relay_is_restarted_by_the_next_subscribe() {
        let broker = InMemoryBroker::new();
        let conn = Arc::new(broker.connect());
        let bus = InvalidationBus::new(conn.clone());
        let publisher = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub_a, mut rx_a) = recorder();
        let (sub_b, mut rx_b) = recorder();
        bus.subscribe("inval", "a", sub_a).await.unwrap();

        // The driver drops the stream underneath the bus.
        conn.unsubscribe("inval").await.unwrap();
        for _ in 0..50 {
            if !bus.is_relaying("inval").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!bus.is_relaying("inval").await);

        bus.subscribe("inval", "b", sub_b).await.unwrap();
        assert!(bus.is_relaying("inval").await);
        publisher.publish("inval", "p", message(9)).await;
        assert_eq!(recv(&mut rx_a).await.unwrap().0, message(9));
        assert_eq!(recv(&mut rx_b).await.unwrap().0, message(9));
    }

    #[tokio::test]
    async fn finalize_stops_everything() {
        let broker = InMemoryBroker::new();
        let bus = InvalidationBus::new(Arc::new(broker.connect()));
        let (sub, _rx) = recorder();
        bus.subscribe("inval", "a", sub).await.unwrap();
        bus.finalize().await;
        assert_eq!(bus.subscriber_count("inval").await, 0);
        // Publishing on a finalized driver is logged, not returned.
        bus.publish("inval", "a", message(5)).await;
    }
}
