//! NATS-based implementation of the EventBus trait

use crate::{validate_subject, BusError, BusMessage, BusResult, EventBus};
use async_nats::{jetstream, Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;

/// How a publish is confirmed
#[derive(Clone)]
enum PublishMode {
    /// Core NATS: publish then flush the connection
    Core,
    /// JetStream: wait for the stream's publish ack
    JetStream(jetstream::Context),
}

/// EventBus implementation over an `async_nats::Client`
///
/// `publish` only returns `Ok(())` once the message has left the client:
/// core mode flushes the connection, JetStream mode awaits the stream ack.
/// The [`crate::HEADER_MESSAGE_ID`] header doubles as JetStream's
/// duplicate-detection id.
///
/// ```rust,no_run
/// use event_bus::{BusMessage, EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::with_jetstream(client);
///
/// bus.publish(BusMessage::new("orders.events", b"{}".to_vec())).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    mode: PublishMode,
}

impl NatsBus {
    /// Core NATS publishing
    pub fn new(client: Client) -> Self {
        Self {
            client,
            mode: PublishMode::Core,
        }
    }

    /// JetStream publishing with acks; the subjects must belong to a stream
    pub fn with_jetstream(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            mode: PublishMode::JetStream(context),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_jetstream(&self) -> bool {
        matches!(self.mode, PublishMode::JetStream(_))
    }

    fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.as_str(), value.as_str());
        }
        map
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        validate_subject(&message.subject)?;

        let headers = Self::header_map(&message.headers);
        let BusMessage {
            subject, payload, ..
        } = message;

        match &self.mode {
            PublishMode::Core => {
                self.client
                    .publish_with_headers(subject, headers, payload.into())
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
                self.client
                    .flush()
                    .await
                    .map_err(|e| BusError::ConnectionError(e.to_string()))?;
            }
            PublishMode::JetStream(context) => {
                let ack = context
                    .publish_with_headers(subject, headers, payload.into())
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
                ack.await
                    .map_err(|e| BusError::PublishError(format!("no publish ack: {e}")))?;
            }
        }

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(nats_headers) = nats_msg.headers {
                for (key, values) in nats_headers.iter() {
                    if let Some(value) = values.first() {
                        msg = msg.with_header(key.to_string(), value.to_string());
                    }
                }
            }

            msg
        });

        Ok(stream.boxed())
    }
}
