//! # Event Bus
//!
//! Broker abstraction shared by every WMS service, plus the CloudEvents
//! envelope all domain events travel in.
//!
//! ## Implementations
//!
//! - **NatsBus**: production broker (core NATS or JetStream with publish acks)
//! - **InMemoryBus**: local development and tests, broadcast channels
//!
//! The outbox relay is the only producer of domain events; it hands each
//! stored envelope to [`EventBus::publish`] and treats `Ok(())` as broker
//! acceptance. Delivery is at-least-once, so every message carries the
//! envelope id in the [`HEADER_MESSAGE_ID`] header for consumer dedup.
//!
//! ```rust,no_run
//! use event_bus::{BusMessage, EnvelopeFactory, EventBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! let factory = EnvelopeFactory::new("/wms/order-service");
//! let envelope = factory.build(
//!     "wms.order.received",
//!     "order/ORD-1",
//!     &serde_json::json!({ "orderId": "ORD-1" }),
//! )?;
//!
//! let message = BusMessage::from_envelope("orders.events", &envelope)?;
//! bus.publish(message).await?;
//! # Ok(())
//! # }
//! ```

mod envelope;
pub mod event_types;
mod factory;
mod inmemory_bus;
mod nats_bus;

pub use envelope::{validate_envelope, EventEnvelope, CONTENT_TYPE_JSON, SPEC_VERSION};
pub use factory::{EnvelopeError, EnvelopeFactory};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

/// Header carrying the envelope id. JetStream uses it for duplicate detection.
pub const HEADER_MESSAGE_ID: &str = "Nats-Msg-Id";

/// Header carrying the CloudEvents `type` so consumers can route without parsing.
pub const HEADER_EVENT_TYPE: &str = "ce-type";

/// A message handed to or received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic (NATS subject) the message is published to
    pub subject: String,
    /// Serialized envelope
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// Serialize an envelope for `subject`, stamping the id and type headers
    pub fn from_envelope(subject: impl Into<String>, envelope: &EventEnvelope) -> BusResult<Self> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        Ok(Self::new(subject, payload)
            .with_header(HEADER_MESSAGE_ID, envelope.id.to_string())
            .with_header(HEADER_EVENT_TYPE, envelope.event_type.clone()))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The envelope id stamped by [`BusMessage::from_envelope`], if any
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(HEADER_MESSAGE_ID).map(String::as_str)
    }

    /// Decode the payload back into an envelope
    pub fn envelope(&self) -> BusResult<EventEnvelope> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| BusError::SerializationError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Publish-subscribe broker used by the outbox relay and by event consumers
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hand a message to the broker.
    ///
    /// `Ok(())` means the broker accepted the message. Any error leaves the
    /// caller responsible for retrying; the broker may or may not have kept it.
    async fn publish(&self, message: BusMessage) -> BusResult<()>;

    /// Subscribe to subjects matching `pattern` (`*` one token, `>` the rest)
    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Reject subjects NATS would refuse (empty tokens, whitespace)
pub(crate) fn validate_subject(subject: &str) -> BusResult<()> {
    if subject.is_empty()
        || subject.split('.').any(str::is_empty)
        || subject.chars().any(char::is_whitespace)
    {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
