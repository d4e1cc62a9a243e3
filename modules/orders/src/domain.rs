//! Order aggregate
//!
//! State changes go through [`Order::create`] and [`Order::cancel`], which
//! record the matching domain events. The repository reads them with
//! [`Order::pending`] and writes them to the outbox in the same
//! transaction as the order document; they are cleared only once that
//! transaction has committed.

use chrono::{DateTime, Utc};
use outbox::DomainEvent;
use serde::{Deserialize, Serialize};

use crate::events::{OrderCancelled, OrderReceived};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Received,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("invalid order: {0}")]
    Validation(String),

    #[error("order {0} is already cancelled")]
    AlreadyCancelled(String),
}

#[derive(Debug, Clone, PartialEq)]
enum PendingEvent {
    Received(OrderReceived),
    Cancelled(OrderCancelled),
}

impl PendingEvent {
    fn boxed(self) -> Box<dyn DomainEvent> {
        match self {
            PendingEvent::Received(e) => Box::new(e),
            PendingEvent::Cancelled(e) => Box::new(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub cancel_reason: Option<String>,
    /// Bumped on every change
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Version last written to the store; 0 until first saved
    #[serde(skip)]
    persisted_version: u32,
    #[serde(skip)]
    pending: Vec<PendingEvent>,
}

impl Order {
    pub fn create(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        lines: Vec<OrderLine>,
    ) -> Result<Self, OrderError> {
        let order_id = order_id.into();
        let customer_id = customer_id.into();

        if order_id.trim().is_empty() {
            return Err(OrderError::Validation("orderId must not be empty".into()));
        }
        if customer_id.trim().is_empty() {
            return Err(OrderError::Validation("customerId must not be empty".into()));
        }
        if lines.is_empty() {
            return Err(OrderError::Validation("an order needs at least one line".into()));
        }
        if let Some(line) = lines.iter().find(|l| l.sku.trim().is_empty() || l.quantity == 0) {
            return Err(OrderError::Validation(format!(
                "line {:?} needs a sku and a positive quantity",
                line.sku
            )));
        }

        let now = Utc::now();
        let event = OrderReceived {
            order_id: order_id.clone(),
            customer_id: customer_id.clone(),
            lines: lines.clone(),
            received_at: now,
        };

        Ok(Self {
            order_id,
            customer_id,
            status: OrderStatus::Received,
            lines,
            cancel_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
            persisted_version: 0,
            pending: vec![PendingEvent::Received(event)],
        })
    }

    pub fn cancel(&mut self, reason: Option<String>) -> Result<(), OrderError> {
        if self.status == OrderStatus::Cancelled {
            return Err(OrderError::AlreadyCancelled(self.order_id.clone()));
        }

        let now = Utc::now();
        self.status = OrderStatus::Cancelled;
        self.cancel_reason = reason.clone();
        self.version += 1;
        self.updated_at = now;
        self.pending.push(PendingEvent::Cancelled(OrderCancelled {
            order_id: self.order_id.clone(),
            reason,
            cancelled_at: now,
        }));
        Ok(())
    }

    /// Never saved
    pub fn is_new(&self) -> bool {
        self.persisted_version == 0
    }

    /// The version the store must still hold for a save to succeed
    pub fn persisted_version(&self) -> u32 {
        self.persisted_version
    }

    /// Called after a successful commit; the recorded events are now in the outbox
    pub(crate) fn mark_persisted(&mut self) {
        self.persisted_version = self.version;
        self.pending.clear();
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Uncommitted events in the order they happened
    pub fn pending(&self) -> Vec<Box<dyn DomainEvent>> {
        self.pending.iter().cloned().map(PendingEvent::boxed).collect()
    }
}
