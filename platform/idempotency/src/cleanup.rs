use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{IdempotencyError, KeyStore, ProcessedMessageStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Abandoned locks moved to `failed`
    pub released: u64,
    /// Records deleted after retention
    pub purged: u64,
    /// Consumer dedup entries deleted after retention
    pub messages_purged: u64,
}

/// Periodic maintenance of the key store, and of the consumer dedup store
/// when one is attached
pub struct KeyCleanup {
    store: Arc<dyn KeyStore>,
    processed: Option<Arc<dyn ProcessedMessageStore>>,
    interval: Duration,
}

impl KeyCleanup {
    pub fn new(store: Arc<dyn KeyStore>, interval: Duration) -> Self {
        Self {
            store,
            processed: None,
            interval,
        }
    }

    pub fn with_processed(mut self, processed: Arc<dyn ProcessedMessageStore>) -> Self {
        self.processed = Some(processed);
        self
    }

    pub async fn run_once(&self) -> Result<CleanupReport, IdempotencyError> {
        let released = self.store.release_expired_locks().await?;
        let purged = self.store.purge_expired().await?;
        let messages_purged = match &self.processed {
            Some(processed) => processed.purge_expired().await?,
            None => 0,
        };
        if released > 0 || purged > 0 || messages_purged > 0 {
            tracing::info!(released, purged, messages_purged, "Idempotency cleanup");
        }
        Ok(CleanupReport {
            released,
            purged,
            messages_purged,
        })
    }

    pub fn start(self) -> CleanupHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut total = CleanupReport::default();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                match self.run_once().await {
                    Ok(report) => {
                        total.released += report.released;
                        total.purged += report.purged;
                        total.messages_purged += report.messages_purged;
                    }
                    Err(e) => tracing::error!(error = %e, "Idempotency key cleanup failed"),
                }
            }

            tracing::info!(
                released = total.released,
                purged = total.purged,
                messages_purged = total.messages_purged,
                "Idempotency cleanup stopped"
            );
            total
        });

        CleanupHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<CleanupReport>,
}

impl CleanupHandle {
    /// Stop after the current pass and return the accumulated totals
    pub async fn stop(self) -> CleanupReport {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Idempotency cleanup task ended abnormally");
                CleanupReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AcquireOutcome, InMemoryKeyStore, InMemoryProcessedStore, LockPolicy, ProcessedMessage,
    };
    use chrono::Utc;
    use uuid::Uuid;

    async fn seed(store: &InMemoryKeyStore, key: &str) {
        let outcome = store
            .try_acquire("order-service", key, "fp", &LockPolicy::default())
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn run_once_releases_and_purges() {
        let store = InMemoryKeyStore::new();
        seed(&store, "abandoned").await;
        seed(&store, "expired").await;
        store.update("order-service", "abandoned", |r| {
            r.lock_expires_at = Utc::now() - chrono::Duration::seconds(5)
        });
        store.update("order-service", "expired", |r| {
            r.expires_at = Utc::now() - chrono::Duration::seconds(5)
        });

        let cleanup = KeyCleanup::new(Arc::new(store.clone()), Duration::from_secs(60));
        let report = cleanup.run_once().await.unwrap();
        assert_eq!(
            report,
            CleanupReport {
                released: 1,
                purged: 1,
                messages_purged: 0
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn started_task_runs_until_stopped() {
        let store = InMemoryKeyStore::new();
        seed(&store, "expired").await;
        store.update("order-service", "expired", |r| {
            r.expires_at = Utc::now() - chrono::Duration::seconds(5)
        });

        let handle = KeyCleanup::new(Arc::new(store.clone()), Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let total = handle.stop().await;

        assert_eq!(total.purged, 1);
        assert!(store.is_empty());
    }

    async fn seed_processed(store: &InMemoryProcessedStore, expires_in: chrono::Duration) {
        let now = Utc::now();
        let recorded = store
            .mark_processed(&ProcessedMessage {
                event_id: Uuid::new_v4(),
                consumer_group: "wave-planner".to_string(),
                service_name: "wave-service".to_string(),
                topic: "orders.events".to_string(),
                event_type: "wms.order.received".to_string(),
                correlation_id: None,
                processed_at: now,
                expires_at: now + expires_in,
            })
            .await
            .unwrap();
        assert!(recorded);
    }

    #[tokio::test]
    async fn scheduled_cleanup_purges_processed_messages() {
        let keys = InMemoryKeyStore::new();
        let processed = InMemoryProcessedStore::new();
        seed_processed(&processed, chrono::Duration::seconds(-5)).await;
        seed_processed(&processed, chrono::Duration::hours(1)).await;

        let handle = KeyCleanup::new(Arc::new(keys), Duration::from_millis(10))
            .with_processed(Arc::new(processed.clone()))
            .start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let total = handle.stop().await;

        assert_eq!(total.messages_purged, 1);
        assert_eq!(processed.len(), 1);
    }
}
