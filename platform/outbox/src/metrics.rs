use chrono::Utc;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

use crate::OutboxStats;

/// Relay metrics, registered on the service's registry
#[derive(Clone)]
pub struct OutboxMetrics {
    // Counters
    pub published_total: IntCounterVec,
    pub publish_failures_total: IntCounterVec,
    pub retried_publishes_total: IntCounterVec,
    pub poison_events_total: IntCounterVec,

    // Histograms
    pub publish_duration_seconds: Histogram,

    // Backlog gauges
    pub backlog: IntGauge,
    pub poison_backlog: IntGauge,
    pub oldest_unpublished_age_seconds: IntGauge,
}

impl OutboxMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published_total = IntCounterVec::new(
            Opts::new("outbox_published_total", "Outbox events accepted by the broker"),
            &["event_type"],
        )?;

        let publish_failures_total = IntCounterVec::new(
            Opts::new("outbox_publish_failures_total", "Failed outbox publish attempts"),
            &["event_type"],
        )?;

        let retried_publishes_total = IntCounterVec::new(
            Opts::new(
                "outbox_retried_publishes_total",
                "Publish attempts for events that had failed before",
            ),
            &["event_type"],
        )?;

        let poison_events_total = IntCounterVec::new(
            Opts::new(
                "outbox_poison_events_total",
                "Events that exhausted their retry budget",
            ),
            &["event_type"],
        )?;

        let publish_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "outbox_publish_duration_seconds",
            "Broker publish duration seconds",
        ))?;

        let backlog = IntGauge::new("outbox_backlog", "Unpublished outbox events")?;
        let poison_backlog = IntGauge::new(
            "outbox_poison_backlog",
            "Unpublished events past their retry budget",
        )?;
        let oldest_unpublished_age_seconds = IntGauge::new(
            "outbox_oldest_unpublished_age_seconds",
            "Age of the oldest unpublished event",
        )?;

        registry.register(Box::new(published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(retried_publishes_total.clone()))?;
        registry.register(Box::new(poison_events_total.clone()))?;
        registry.register(Box::new(publish_duration_seconds.clone()))?;
        registry.register(Box::new(backlog.clone()))?;
        registry.register(Box::new(poison_backlog.clone()))?;
        registry.register(Box::new(oldest_unpublished_age_seconds.clone()))?;

        Ok(Self {
            published_total,
            publish_failures_total,
            retried_publishes_total,
            poison_events_total,
            publish_duration_seconds,
            backlog,
            poison_backlog,
            oldest_unpublished_age_seconds,
        })
    }

    pub fn observe_stats(&self, stats: &OutboxStats) {
        self.backlog.set(stats.backlog as i64);
        self.poison_backlog.set(stats.poison as i64);
        let age = stats
            .oldest_unpublished_age(Utc::now())
            .map_or(0, |age| age.num_seconds().max(0));
        self.oldest_unpublished_age_seconds.set(age);
    }
}
