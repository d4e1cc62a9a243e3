//! Consumer-side deduplication by envelope id
//!
//! The outbox relay delivers at least once, so a consumer group can see the
//! same envelope more than once. [`DedupConsumer`] records each envelope id
//! after its handler succeeds and skips ids it has already recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::{IdempotencyError, IdempotencyMetrics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub event_id: Uuid,
    pub consumer_group: String,
    pub service_name: String,
    pub topic: String,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    async fn is_processed(
        &self,
        consumer_group: &str,
        event_id: Uuid,
    ) -> Result<bool, IdempotencyError>;

    /// Returns `false` when another delivery recorded the id first
    async fn mark_processed(&self, message: &ProcessedMessage) -> Result<bool, IdempotencyError>;

    async fn purge_expired(&self) -> Result<u64, IdempotencyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Processed,
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum DedupError<E> {
    #[error("handler failed: {0}")]
    Handler(E),

    #[error("dedup store failed: {0}")]
    Store(#[source] IdempotencyError),
}

pub struct DedupConsumer {
    store: Arc<dyn ProcessedMessageStore>,
    service_name: String,
    consumer_group: String,
    retention: Duration,
    metrics: Option<IdempotencyMetrics>,
}

impl DedupConsumer {
    pub fn new(
        store: Arc<dyn ProcessedMessageStore>,
        service_name: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            store,
            service_name: service_name.into(),
            consumer_group: consumer_group.into(),
            retention: Duration::from_secs(24 * 60 * 60),
            metrics: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_metrics(mut self, metrics: IdempotencyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Run `handler` unless this consumer group already processed `envelope`
    ///
    /// A handler error leaves the id unrecorded so redelivery retries it.
    pub async fn handle<'a, F, Fut, E>(
        &self,
        topic: &str,
        envelope: &'a EventEnvelope,
        handler: F,
    ) -> Result<DedupOutcome, DedupError<E>>
    where
        F: FnOnce(&'a EventEnvelope) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let labels = [
            self.service_name.as_str(),
            topic,
            envelope.event_type.as_str(),
        ];

        let seen = self
            .store
            .is_processed(&self.consumer_group, envelope.id)
            .await
            .map_err(|e| self.store_error(&labels, envelope, e))?;

        if seen {
            self.count(|m| &m.dedup_hits_total, &labels);
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                topic = %topic,
                consumer_group = %self.consumer_group,
                "Duplicate message skipped"
            );
            return Ok(DedupOutcome::Duplicate);
        }

        self.count(|m| &m.dedup_misses_total, &labels);
        handler(envelope).await.map_err(DedupError::Handler)?;

        let now = Utc::now();
        let message = ProcessedMessage {
            event_id: envelope.id,
            consumer_group: self.consumer_group.clone(),
            service_name: self.service_name.clone(),
            topic: topic.to_string(),
            event_type: envelope.event_type.clone(),
            correlation_id: envelope.correlation_id.clone(),
            processed_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.retention)
                    .unwrap_or_else(|_| chrono::Duration::days(365)),
        };

        let inserted = self
            .store
            .mark_processed(&message)
            .await
            .map_err(|e| self.store_error(&labels, envelope, e))?;
        if !inserted {
            tracing::warn!(
                event_id = %envelope.id,
                consumer_group = %self.consumer_group,
                "Message was processed concurrently"
            );
        }

        Ok(DedupOutcome::Processed)
    }

    fn count<F>(&self, counter: F, labels: &[&str])
    where
        F: FnOnce(&IdempotencyMetrics) -> &prometheus::IntCounterVec,
    {
        if let Some(m) = &self.metrics {
            counter(m).with_label_values(labels).inc();
        }
    }

    fn store_error<E>(
        &self,
        labels: &[&str],
        envelope: &EventEnvelope,
        error: IdempotencyError,
    ) -> DedupError<E> {
        self.count(|m| &m.dedup_errors_total, labels);
        tracing::error!(
            event_id = %envelope.id,
            consumer_group = %self.consumer_group,
            error = %error,
            "Dedup store operation failed"
        );
        DedupError::Store(error)
    }
}

type Processed = HashMap<(String, Uuid), ProcessedMessage>;

#[derive(Debug, Clone)]
pub struct InMemoryProcessedStore {
    messages: Arc<Mutex<Processed>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryProcessedStore {
    fn default() -> Self {
        Self {
            messages: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryProcessedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Processed>, IdempotencyError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(IdempotencyError::Storage(
                "in-memory dedup store unavailable".to_string(),
            ));
        }
        Ok(self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ProcessedMessageStore for InMemoryProcessedStore {
    async fn is_processed(
        &self,
        consumer_group: &str,
        event_id: Uuid,
    ) -> Result<bool, IdempotencyError> {
        let now = Utc::now();
        let messages = self.lock()?;
        Ok(messages
            .get(&(consumer_group.to_string(), event_id))
            .is_some_and(|m| m.expires_at > now))
    }

    async fn mark_processed(&self, message: &ProcessedMessage) -> Result<bool, IdempotencyError> {
        let mut messages = self.lock()?;
        let id = (message.consumer_group.clone(), message.event_id);
        match messages.get(&id) {
            Some(existing) if existing.expires_at > message.processed_at => Ok(false),
            _ => {
                messages.insert(id, message.clone());
                Ok(true)
            }
        }
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let now = Utc::now();
        let mut messages = self.lock()?;
        let before = messages.len();
        messages.retain(|_, m| m.expires_at > now);
        Ok((before - messages.len()) as u64)
    }
}

const PROCESSED_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processed_messages (
    consumer_group  TEXT NOT NULL,
    event_id        UUID NOT NULL,
    service_name    TEXT NOT NULL,
    topic           TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    correlation_id  TEXT,
    processed_at    TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (consumer_group, event_id)
);

CREATE INDEX IF NOT EXISTS idx_processed_messages_expires_at
    ON processed_messages (expires_at);
"#;

#[derive(Debug, Clone)]
pub struct PgProcessedStore {
    pool: PgPool,
}

impl PgProcessedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), IdempotencyError> {
        sqlx::raw_sql(PROCESSED_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedMessageStore for PgProcessedStore {
    async fn is_processed(
        &self,
        consumer_group: &str,
        event_id: Uuid,
    ) -> Result<bool, IdempotencyError> {
        let found: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM processed_messages
            WHERE consumer_group = $1 AND event_id = $2 AND expires_at > NOW()
            "#,
        )
        .bind(consumer_group)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn mark_processed(&self, message: &ProcessedMessage) -> Result<bool, IdempotencyError> {
        // An expired row is overwritten; a live one wins
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages
                (consumer_group, event_id, service_name, topic, event_type, correlation_id,
                 processed_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (consumer_group, event_id) DO UPDATE SET
                service_name = EXCLUDED.service_name,
                topic = EXCLUDED.topic,
                event_type = EXCLUDED.event_type,
                correlation_id = EXCLUDED.correlation_id,
                processed_at = EXCLUDED.processed_at,
                expires_at = EXCLUDED.expires_at
            WHERE processed_messages.expires_at <= EXCLUDED.processed_at
            "#,
        )
        .bind(&message.consumer_group)
        .bind(message.event_id)
        .bind(&message.service_name)
        .bind(&message.topic)
        .bind(&message.event_type)
        .bind(&message.correlation_id)
        .bind(message.processed_at)
        .bind(message.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let result = sqlx::query("DELETE FROM processed_messages WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
