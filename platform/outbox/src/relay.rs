//! Outbox relay: the background loop moving pending records to the broker

use chrono::Utc;
use event_bus::{BusMessage, EventBus};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{OutboxError, OutboxMetrics, OutboxRecord, OutboxStore, RelayConfig};

/// Outcome of one [`OutboxRelay::run_once`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Left for a later batch because an earlier record of the aggregate failed
    pub deferred: usize,
    /// Failures that spent the record's last retry
    pub poisoned: usize,
}

/// Totals over the lifetime of a started relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub batches: u64,
    pub published: u64,
    pub failed: u64,
    pub poisoned: u64,
    pub purged: u64,
    /// Store errors that aborted a batch or cleanup
    pub errors: u64,
}

impl RelayStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.published += report.published as u64;
        self.failed += report.failed as u64;
        self.poisoned += report.poisoned as u64;
    }
}

pub struct OutboxRelay<S: OutboxStore> {
    store: Arc<S>,
    bus: Arc<dyn EventBus>,
    config: RelayConfig,
    metrics: Option<OutboxMetrics>,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: Arc<S>, bus: Arc<dyn EventBus>, config: RelayConfig) -> Self {
        Self {
            store,
            bus,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Publish one batch.
    ///
    /// A failed record is retried later with backoff and defers the remaining
    /// records of its aggregate to a later batch; other aggregates proceed.
    pub async fn run_once(&self) -> Result<BatchReport, OutboxError> {
        let records = self.store.find_unpublished(self.config.batch_size).await?;
        let mut report = BatchReport {
            fetched: records.len(),
            ..Default::default()
        };
        let mut blocked: HashSet<(String, String)> = HashSet::new();

        for record in records {
            let key = (record.aggregate_type.clone(), record.aggregate_id.clone());
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }

            match self.publish(&record).await {
                Ok(()) => match self.store.mark_published(record.event_id).await {
                    Ok(()) => {
                        report.published += 1;
                        tracing::debug!(
                            event_id = %record.event_id,
                            event_type = %record.event_type,
                            topic = %record.topic,
                            "Event published"
                        );
                    }
                    Err(e) => {
                        // The broker has it; it goes out again next batch
                        tracing::error!(
                            event_id = %record.event_id,
                            error = %e,
                            "Published event could not be marked, it will be republished"
                        );
                        blocked.insert(key);
                    }
                },
                Err(reason) => {
                    report.failed += 1;
                    blocked.insert(key);
                    if self.record_failure(&record, &reason).await {
                        report.poisoned += 1;
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            match self.store.stats().await {
                Ok(stats) => metrics.observe_stats(&stats),
                Err(e) => tracing::warn!(error = %e, "Could not refresh outbox gauges"),
            }
        }

        Ok(report)
    }

    async fn publish(&self, record: &OutboxRecord) -> Result<(), String> {
        let message =
            BusMessage::from_envelope(&record.topic, &record.envelope).map_err(|e| e.to_string())?;

        let started = Instant::now();
        let result = self.bus.publish(message).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .publish_duration_seconds
                .observe(started.elapsed().as_secs_f64());
            if record.retry_count > 0 {
                metrics
                    .retried_publishes_total
                    .with_label_values(&[record.event_type.as_str()])
                    .inc();
            }
            let counter = if result.is_ok() {
                &metrics.published_total
            } else {
                &metrics.publish_failures_total
            };
            counter.with_label_values(&[record.event_type.as_str()]).inc();
        }

        result.map_err(|e| e.to_string())
    }

    /// Returns true when this failure made the record poison
    async fn record_failure(&self, record: &OutboxRecord, reason: &str) -> bool {
        let attempt = record.retry_count + 1;
        let next_attempt_at = self.config.backoff.next_attempt_at(Utc::now(), attempt);

        let retry_count = match self
            .store
            .increment_retry(record.event_id, reason, next_attempt_at)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(
                    event_id = %record.event_id,
                    error = %e,
                    "Failed to record publish failure"
                );
                return false;
            }
        };

        if retry_count >= record.max_retries {
            tracing::error!(
                event_id = %record.event_id,
                event_type = %record.event_type,
                aggregate_id = %record.aggregate_id,
                retry_count,
                error = %reason,
                "Poison event: retry budget exhausted, operator attention required"
            );
            if let Some(metrics) = &self.metrics {
                metrics
                    .poison_events_total
                    .with_label_values(&[record.event_type.as_str()])
                    .inc();
            }
            true
        } else {
            tracing::warn!(
                event_id = %record.event_id,
                event_type = %record.event_type,
                retry_count,
                next_attempt_at = %next_attempt_at,
                error = %reason,
                "Publish failed, will retry"
            );
            false
        }
    }

    /// Delete records published longer ago than the retention window
    pub async fn cleanup(&self) -> Result<u64, OutboxError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| OutboxError::Storage(format!("retention out of range: {e}")))?;
        let deleted = self.store.delete_published(Utc::now() - retention).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Purged published outbox events");
        }
        Ok(deleted)
    }

    /// Run the poll loop on its own task until the handle is stopped or dropped
    pub fn start(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        RelayHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayStats {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox relay"
        );

        let mut stats = RelayStats::default();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            // A started batch always runs to completion
            match self.run_once().await {
                Ok(report) => {
                    stats.absorb(&report);
                    if report.published > 0 || report.failed > 0 {
                        tracing::info!(
                            published = report.published,
                            failed = report.failed,
                            deferred = report.deferred,
                            "Outbox batch processed"
                        );
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::error!(error = %e, "Outbox batch failed");
                }
            }

            if last_cleanup.elapsed() >= self.config.cleanup_interval {
                last_cleanup = Instant::now();
                match self.cleanup().await {
                    Ok(deleted) => stats.purged += deleted,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::error!(error = %e, "Outbox cleanup failed");
                    }
                }
            }
        }

        tracing::info!(
            batches = stats.batches,
            published = stats.published,
            "Outbox relay stopped"
        );
        stats
    }
}

/// Owner of a running relay task
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<RelayStats>,
}

impl RelayHandle {
    /// Let the in-flight batch finish, then stop
    pub async fn stop(self) -> RelayStats {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "Outbox relay task ended abnormally");
                RelayStats::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
