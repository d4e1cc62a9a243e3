#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{BusError, BusMessage, BusResult, EnvelopeFactory, EventBus};
use futures::stream::{self, BoxStream, StreamExt};
use outbox::{InMemoryOutboxStore, OutboxError, OutboxRecord, OutboxStats, OutboxStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn record(aggregate_id: &str, seq: u32) -> OutboxRecord {
    let envelope = EnvelopeFactory::new("/wms/order-service")
        .build(
            "wms.order.received",
            &format!("order/{aggregate_id}"),
            &serde_json::json!({ "orderId": aggregate_id, "seq": seq }),
        )
        .unwrap();
    OutboxRecord::from_envelope("order", aggregate_id, "orders.events", envelope)
}

pub async fn seed(store: &InMemoryOutboxStore, records: &[OutboxRecord]) {
    let mut tx = store.begin();
    store.save_all(&mut tx, records).await.unwrap();
    tx.commit().unwrap();
}

/// Broker double with per-event failure scripts and an optional publish delay
#[derive(Default)]
pub struct ScriptedBus {
    accepted: Mutex<Vec<BusMessage>>,
    failures: Mutex<HashMap<String, usize>>,
    fail_all: Mutex<bool>,
    attempts: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject the next `times` publishes of `event_id`
    pub fn fail_event(&self, event_id: Uuid, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(event_id.to_string(), times);
    }

    pub fn fail_all(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Message ids in the order the broker accepted them
    pub fn accepted_ids(&self) -> Vec<String> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.message_id().map(str::to_string))
            .collect()
    }

    /// First-delivery order of ids, duplicates removed
    pub fn first_deliveries(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.accepted_ids()
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}

#[async_trait]
impl EventBus for ScriptedBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.fail_all.lock().unwrap() {
            return Err(BusError::ConnectionError("broker down".into()));
        }

        let id = message.message_id().unwrap_or_default().to_string();
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BusError::PublishError(format!("scripted failure for {id}")));
                }
            }
        }

        self.accepted.lock().unwrap().push(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        _pattern: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        Ok(stream::empty().boxed())
    }
}

/// Outbox store whose `mark_published` can be made to fail, simulating a
/// crash between broker acceptance and the status update
#[derive(Clone, Default)]
pub struct CrashingStore {
    pub inner: InMemoryOutboxStore,
    failing_marks: Arc<AtomicUsize>,
}

impl CrashingStore {
    pub fn fail_next_marks(&self, n: usize) {
        self.failing_marks.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutboxStore for CrashingStore {
    type Tx = <InMemoryOutboxStore as OutboxStore>::Tx;

    async fn save_all(&self, tx: &mut Self::Tx, records: &[OutboxRecord]) -> Result<(), OutboxError> {
        self.inner.save_all(tx, records).await
    }

    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.inner.find_unpublished(limit).await
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        let crashed = self
            .failing_marks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crashed {
            return Err(OutboxError::Storage("process died before mark".into()));
        }
        self.inner.mark_published(event_id).await
    }

    async fn increment_retry(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, OutboxError> {
        self.inner.increment_retry(event_id, error, next_attempt_at).await
    }

    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        self.inner.delete_published(older_than).await
    }

    async fn find_poison(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.inner.find_poison(limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        self.inner.stats().await
    }
}
