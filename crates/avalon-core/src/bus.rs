//! Outbound/inbound event port: topic-based publish/subscribe.
//!
//! Grains never talk to a transport directly. They publish JSON documents
//! to string topics through an [`EventBus`] and consume subscriptions as
//! byte streams. Delivery is assumed at-least-once; consumers must be
//! idempotent.
//!
//! [`InMemoryBus`] is the process-local implementation used for
//! single-node runs and tests. The engine binary provides a NATS-backed one.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A subscription: raw message bodies in publish order.
pub type BusStream = BoxStream<'static, Vec<u8>>;

/// Errors raised by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publishing failed at the transport.
    #[error("failed to publish to {topic}: {message}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Transport error message.
        message: String,
    },

    /// Subscribing failed at the transport.
    #[error("failed to subscribe to {topic}: {message}")]
    Subscribe {
        /// Target topic.
        topic: String,
        /// Transport error message.
        message: String,
    },

    /// The event could not be serialized.
    #[error("failed to encode event: {source}")]
    Encode {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Topic-based publish/subscribe transport.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish one message to `topic`. Messages to topics without
    /// subscribers are dropped.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to `topic`. The stream ends when the transport closes.
    async fn subscribe(&self, topic: &str) -> Result<BusStream, BusError>;
}

/// Serialize `event` as JSON and publish it.
pub async fn publish_event<T: Serialize + Sync>(
    bus: &dyn EventBus,
    topic: &str,
    event: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(event)?;
    bus.publish(topic, payload).await
}

/// Publish without surfacing errors: failures are logged and dropped.
pub async fn publish_logged<T: Serialize + Sync>(bus: &dyn EventBus, topic: &str, event: &T) {
    if let Err(e) = publish_event(bus, topic, event).await {
        warn!(topic, error = %e, "bus publish failed");
    }
}

/// Decode a JSON message, logging and discarding malformed ones.
pub fn decode_event<T: DeserializeOwned>(topic: &str, bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(topic, error = %e, "discarding malformed bus message");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local bus: every subscriber gets its own unbounded channel.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn subscriber_count(&self, topic: &str) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get_mut(topic).map_or(0, |senders| {
            senders.retain(|s| !s.is_closed());
            senders.len()
        })
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = topics.get_mut(topic) else {
            debug!(topic, "no subscribers, dropping message");
            return Ok(());
        };
        senders.retain(|s| s.unbounded_send(payload.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, BusError> {
        let (tx, rx) = mpsc::unbounded();
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("t").await.unwrap();
        let mut b = bus.subscribe("t").await.unwrap();

        bus.publish("t", b"hello".to_vec()).await.unwrap();

        assert_eq!(a.next().await.unwrap(), b"hello".to_vec());
        assert_eq!(b.next().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("a").await.unwrap();

        bus.publish("b", b"x".to_vec()).await.unwrap();
        bus.publish("a", b"y".to_vec()).await.unwrap();

        assert_eq!(a.next().await.unwrap(), b"y".to_vec());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("t").await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        drop(sub);
        bus.publish("t", b"x".to_vec()).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn publish_event_round_trips_json() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("json").await.unwrap();

        publish_event(&bus, "json", &vec![1_u32, 2, 3]).await.unwrap();

        let bytes = sub.next().await.unwrap();
        let decoded: Option<Vec<u32>> = decode_event("json", &bytes);
        assert_eq!(decoded, Some(vec![1, 2, 3]));
        assert_eq!(decode_event::<Vec<u32>>("json", b"not json"), None);
    }
}
