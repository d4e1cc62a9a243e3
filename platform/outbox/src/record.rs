use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Publish attempts before a record is treated as poison
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// One event waiting for (or done with) relay to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Same value as `envelope.id`
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Broker subject
    pub topic: String,
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Earliest instant the relay may try again; `None` means now
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn from_envelope(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        topic: impl Into<String>,
        envelope: EventEnvelope,
    ) -> Self {
        Self {
            event_id: envelope.id,
            event_type: envelope.event_type.clone(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            topic: topic.into(),
            envelope,
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Retry budget exhausted while still unpublished
    pub fn is_poison(&self) -> bool {
        !self.is_published() && self.retry_count >= self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Ordering key for the owning aggregate
    pub fn aggregate_key(&self) -> (&str, &str) {
        (&self.aggregate_type, &self.aggregate_id)
    }
}

/// Result of a committed write: the events now pending relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    pub event_ids: Vec<Uuid>,
}

impl CommitReceipt {
    pub fn len(&self) -> usize {
        self.event_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }
}

/// Backlog snapshot for health and metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    /// Unpublished records, poison included
    pub backlog: u64,
    pub poison: u64,
    pub published: u64,
    /// Sum of `retry_count` over unpublished records
    pub total_retries: u64,
    pub oldest_unpublished_at: Option<DateTime<Utc>>,
}

impl OutboxStats {
    pub fn oldest_unpublished_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.oldest_unpublished_at.map(|at| now - at)
    }
}
