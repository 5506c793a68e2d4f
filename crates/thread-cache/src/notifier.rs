//! Cross-process pub/sub.
//!
//! [`Bus`] moves raw payloads per topic; [`Notifier`] wraps [`SyncEvent`]s in an envelope tagged with
//! the publishing process id and a unique event id, and its subscriptions drop both self-sent and
//! repeated events.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use redis::aio::ConnectionManager;
use redis::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BusError, BusResult, StoreResult};
use crate::events::SyncEvent;
use crate::metrics;

const CHANNEL_CAPACITY: usize = 256;
const RECENT_EVENT_IDS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus. Engines sharing one `LocalBus` see each other's events.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        Ok(self.sender_for(topic).subscribe())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        // Pub/sub is fire-and-forget: no subscriber is not an error.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

type TopicSenders = Arc<Mutex<HashMap<String, broadcast::Sender<BusMessage>>>>;

/// Redis pub/sub. One subscriber connection per topic fans out into a local broadcast channel.
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    topics: TopicSenders,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            topics: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        let existing = self.topics.lock().get(topic).map(|sender| sender.subscribe());
        if let Some(receiver) = existing {
            return Ok(receiver);
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let sender = {
            let mut topics = self.topics.lock();
            if let Some(existing) = topics.get(topic) {
                // Lost a race with a concurrent subscribe; reuse its connection.
                return Ok(existing.subscribe());
            }
            let sender = broadcast::channel(CHANNEL_CAPACITY).0;
            topics.insert(topic.to_string(), sender.clone());
            sender
        };
        let receiver = sender.subscribe();

        let topics = Arc::clone(&self.topics);
        let topic_name = topic.to_string();
        tokio::spawn(async move {
            let messages = pubsub.into_on_message().map(|msg| BusMessage {
                topic: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            });
            forward_messages(Box::pin(messages), sender, topics, topic_name).await;
        });

        Ok(receiver)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload.as_ref())
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        Ok(())
    }
}

/// Pump one topic's messages into its broadcast channel until the source ends or the last local
/// receiver is gone. Returning drops the source, closing its Redis connection.
async fn forward_messages<S>(
    mut messages: S,
    sender: broadcast::Sender<BusMessage>,
    topics: TopicSenders,
    topic: String,
) where
    S: Stream<Item = BusMessage> + Unpin,
{
    while let Some(message) = messages.next().await {
        if sender.send(message).is_ok() {
            continue;
        }
        // Subscribers attach under this lock, so a zero count here is final.
        let mut current = topics.lock();
        if sender.receiver_count() == 0 {
            forget_topic(&mut current, &topic, &sender);
            debug!(topic = %topic, "no local subscribers left; closing redis subscription");
            return;
        }
    }
    warn!(topic = %topic, "redis subscription closed");
    forget_topic(&mut topics.lock(), &topic, &sender);
}

fn forget_topic(
    topics: &mut HashMap<String, broadcast::Sender<BusMessage>>,
    topic: &str,
    sender: &broadcast::Sender<BusMessage>,
) {
    if topics
        .get(topic)
        .is_some_and(|current| current.same_channel(sender))
    {
        topics.remove(topic);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    sender: String,
    event_id: String,
    #[serde(rename = "type")]
    kind: String,
    payload: T,
}

#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn Bus>,
    sender_id: String,
}

impl Notifier {
    pub fn new(bus: Arc<dyn Bus>, sender_id: impl Into<String>) -> Self {
        Self {
            bus,
            sender_id: sender_id.into(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub async fn publish(&self, topic: &str, event: &SyncEvent) -> BusResult<()> {
        let envelope = Envelope {
            sender: self.sender_id.clone(),
            event_id: Uuid::new_v4().to_string(),
            kind: event.kind().to_string(),
            payload: event,
        };
        let bytes =
            serde_json::to_vec(&envelope).map_err(|err| BusError::Transport(err.to_string()))?;
        self.bus.publish(topic, Bytes::from(bytes)).await?;
        metrics::EVENTS.with_label_values(&["published"]).inc();
        Ok(())
    }

    /// Publish and log failures instead of returning them; used where the local state change has
    /// already happened and must not be undone by a notification hiccup.
    pub async fn publish_or_warn(&self, topic: &str, event: &SyncEvent) {
        if let Err(err) = self.publish(topic, event).await {
            warn!(topic = %topic, kind = event.kind(), error = %err, "event publish failed");
        }
    }

    /// Run `handler` for every event on `topic` sent by another process. Abort the returned handle
    /// to unsubscribe.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> BusResult<JoinHandle<()>>
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        let mut receiver = self.bus.subscribe(topic).await?;
        let own_id = self.sender_id.clone();
        let topic = topic.to_string();
        Ok(tokio::spawn(async move {
            let mut seen: LruCache<String, ()> = LruCache::new(
                NonZeroUsize::new(RECENT_EVENT_IDS).unwrap_or(NonZeroUsize::MIN),
            );
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        let envelope: Envelope<SyncEvent> = match serde_json::from_slice(&msg.payload)
                        {
                            Ok(envelope) => envelope,
                            Err(err) => {
                                warn!(topic = %topic, error = %err, "dropping malformed event");
                                continue;
                            }
                        };
                        if envelope.sender == own_id {
                            metrics::EVENTS.with_label_values(&["ignored_self"]).inc();
                            continue;
                        }
                        if seen.put(envelope.event_id, ()).is_some() {
                            metrics::EVENTS.with_label_values(&["ignored_duplicate"]).inc();
                            continue;
                        }
                        metrics::EVENTS.with_label_values(&["received"]).inc();
                        handler(envelope.payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %topic, "event channel closed");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogEntry, Role};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sample() -> SyncEvent {
        SyncEvent::EntryUpserted {
            entry: LogEntry::new("m1", "t1", Role::User, "hi", 1),
        }
    }

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("channel:sync").await.unwrap();
        bus.publish("channel:sync", Bytes::from_static(b"ping"))
            .await
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "channel:sync");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        assert!(bus.publish("nobody", Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_skip_their_own_events() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        let a = Notifier::new(bus.clone(), "proc-a");
        let b = Notifier::new(bus.clone(), "proc-b");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _ha = a
            .subscribe("topic", move |event| {
                let _ = tx_a.send(event);
            })
            .await
            .unwrap();
        let _hb = b
            .subscribe("topic", move |event| {
                let _ = tx_b.send(event);
            })
            .await
            .unwrap();

        a.publish("topic", &sample()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, sample());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx_a.recv())
                .await
                .is_err(),
            "publisher must not see its own event"
        );
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_dropped() {
        let bus = Arc::new(LocalBus::new());
        let listener = Notifier::new(bus.clone(), "listener");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _h = listener
            .subscribe("topic", move |event| {
                let _ = tx.send(event);
            })
            .await
            .unwrap();

        let envelope = Envelope {
            sender: "other".to_string(),
            event_id: "evt-1".to_string(),
            kind: "entry_upserted".to_string(),
            payload: sample(),
        };
        let bytes = Bytes::from(serde_json::to_vec(&envelope).unwrap());
        bus.publish("topic", bytes.clone()).await.unwrap();
        bus.publish("topic", bytes).await.unwrap();
        bus.publish("topic", Bytes::from_static(b"garbage")).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    fn message(payload: &'static [u8]) -> BusMessage {
        BusMessage {
            topic: "channel:thread:t1".to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    fn topic_map(sender: &broadcast::Sender<BusMessage>) -> TopicSenders {
        let mut topics = HashMap::new();
        topics.insert("channel:thread:t1".to_string(), sender.clone());
        Arc::new(Mutex::new(topics))
    }

    #[tokio::test]
    async fn forwarder_stops_once_local_subscribers_leave() {
        let sender = broadcast::channel(CHANNEL_CAPACITY).0;
        let topics = topic_map(&sender);
        drop(sender.subscribe());

        // The source never ends on its own, like a live Redis subscription.
        let source = futures_util::stream::iter(vec![message(b"one"), message(b"two")])
            .chain(futures_util::stream::pending());
        tokio::time::timeout(
            Duration::from_secs(1),
            forward_messages(
                Box::pin(source),
                sender,
                topics.clone(),
                "channel:thread:t1".to_string(),
            ),
        )
        .await
        .expect("forwarder exits without receivers");
        assert!(topics.lock().is_empty());
    }

    #[tokio::test]
    async fn forwarder_delivers_while_subscribed() {
        let sender = broadcast::channel(CHANNEL_CAPACITY).0;
        let topics = topic_map(&sender);
        let mut receiver = sender.subscribe();

        let source = futures_util::stream::iter(vec![message(b"one"), message(b"two")]);
        forward_messages(
            Box::pin(source),
            sender,
            topics.clone(),
            "channel:thread:t1".to_string(),
        )
        .await;
        assert_eq!(receiver.recv().await.unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(receiver.recv().await.unwrap().payload, Bytes::from_static(b"two"));
        // Source ended: the topic is released for a fresh subscription.
        assert!(topics.lock().is_empty());
    }
}
