//! In-memory implementation of the EventBus trait for testing and development

use crate::{validate_subject, BusError, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1000;

/// EventBus backed by a Tokio broadcast channel
///
/// Every accepted message is also appended to a bounded publish log so tests
/// can assert on what reached the broker without holding a subscription open.
/// [`InMemoryBus::set_available`] simulates a broker outage: while unavailable,
/// `publish` fails with [`BusError::ConnectionError`] and nothing is logged.
///
/// ```rust
/// use event_bus::{BusMessage, EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe("orders.>").await?;
///
/// bus.publish(BusMessage::new("orders.events", b"hello".to_vec())).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "orders.events");
/// assert_eq!(bus.published().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    log: Arc<Mutex<VecDeque<BusMessage>>>,
    capacity: usize,
    available: Arc<AtomicBool>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds both the broadcast buffer and the publish log;
    /// the oldest entries are dropped first.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
            log: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle simulated broker availability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Snapshot of accepted messages, oldest first
    pub fn published(&self) -> Vec<BusMessage> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.iter().cloned().collect()
    }

    /// Accepted messages on `subject`, oldest first
    pub fn published_to(&self, subject: &str) -> Vec<BusMessage> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.iter().filter(|m| m.subject == subject).cloned().collect()
    }

    pub fn clear_published(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// NATS-style wildcard matching: `*` is exactly one token, `>` one or more
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let mut subject_tokens = subject.split('.');
        let mut pattern_tokens = pattern.split('.');

        loop {
            match (pattern_tokens.next(), subject_tokens.next()) {
                (Some(">"), Some(_)) => return true,
                (Some("*"), Some(_)) => {}
                (Some(p), Some(s)) if p == s => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        validate_subject(&message.subject)?;

        if !self.is_available() {
            return Err(BusError::ConnectionError(
                "in-memory broker unavailable".to_string(),
            ));
        }

        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            if log.len() == self.capacity {
                log.pop_front();
            }
            log.push_back(message.clone());
        }

        // No receivers is fine
        let _ = self.sender.send(message);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        if pattern.is_empty() {
            return Err(BusError::SubscribeError("empty pattern".to_string()));
        }

        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(pattern = %pattern, skipped, "InMemoryBus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
