//! [`EventBus`] over NATS core subjects.
//!
//! Topics map one-to-one to NATS subjects and payloads are passed through
//! untouched. Delivery is whatever core NATS gives: at most once per
//! subscriber, which the inventory's sequence check tolerates.

use async_trait::async_trait;
use futures::StreamExt as _;
use tracing::info;

use avalon_core::bus::{BusError, BusStream, EventBus};

/// A bus backed by one NATS client connection.
#[derive(Debug, Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, async_nats::ConnectError> {
        let client = async_nats::connect(url).await?;
        info!(nats_url = url, "Connected to NATS");
        Ok(Self { client })
    }

    /// Flush buffered publishes.
    pub async fn flush(&self) {
        if let Err(e) = self.client.flush().await {
            tracing::warn!(error = %e, "NATS flush failed");
        }
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic.to_owned(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_owned(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, BusError> {
        let subscriber = self
            .client
            .subscribe(topic.to_owned())
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_owned(),
                message: e.to_string(),
            })?;
        Ok(subscriber.map(|message| message.payload.to_vec()).boxed())
    }
}
