use chrono::{DateTime, Utc};
use event_bus::event_types::{self, sources, topics};
use event_bus::EnvelopeFactory;
use outbox::{DomainEvent, EventRegistry};
use serde::{Deserialize, Serialize};
use std::any::Any;

use crate::domain::OrderLine;

pub const AGGREGATE_TYPE: &str = "order";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceived {
    pub order_id: String,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: String,
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

impl DomainEvent for OrderReceived {
    fn event_type(&self) -> &'static str {
        event_types::ORDER_RECEIVED
    }

    fn aggregate_id(&self) -> &str {
        &self.order_id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl DomainEvent for OrderCancelled {
    fn event_type(&self) -> &'static str {
        event_types::ORDER_CANCELLED
    }

    fn aggregate_id(&self) -> &str {
        &self.order_id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry for every event the order service emits
pub fn registry(max_retries: u32) -> EventRegistry {
    let mut registry = EventRegistry::new(EnvelopeFactory::new(sources::ORDER_MANAGEMENT))
        .with_max_retries(max_retries);
    registry
        .register::<OrderReceived>(
            event_types::ORDER_RECEIVED,
            AGGREGATE_TYPE,
            topics::ORDERS,
            |e| format!("order/{}", e.order_id),
        )
        .register::<OrderCancelled>(
            event_types::ORDER_CANCELLED,
            AGGREGATE_TYPE,
            topics::ORDERS,
            |e| format!("order/{}", e.order_id),
        );
    registry
}
