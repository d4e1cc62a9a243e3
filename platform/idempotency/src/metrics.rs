use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Gate and consumer-dedup metrics, registered on the service's registry
#[derive(Clone)]
pub struct IdempotencyMetrics {
    // Gate
    pub hits_total: IntCounterVec,
    pub misses_total: IntCounterVec,
    pub parameter_mismatches_total: IntCounterVec,
    pub concurrent_collisions_total: IntCounterVec,
    pub lock_acquisition_duration_seconds: HistogramVec,
    pub storage_errors_total: IntCounterVec,

    // Consumers
    pub dedup_hits_total: IntCounterVec,
    pub dedup_misses_total: IntCounterVec,
    pub dedup_errors_total: IntCounterVec,
}

impl IdempotencyMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let request_labels = &["service", "path", "method"];
        let message_labels = &["service", "topic", "event_type"];

        let hits_total = IntCounterVec::new(
            Opts::new("idempotency_hits_total", "Requests answered from a cached response"),
            request_labels,
        )?;
        let misses_total = IntCounterVec::new(
            Opts::new("idempotency_misses_total", "Keyed requests that executed the handler"),
            request_labels,
        )?;
        let parameter_mismatches_total = IntCounterVec::new(
            Opts::new(
                "idempotency_parameter_mismatches_total",
                "Keys reused with a different request",
            ),
            request_labels,
        )?;
        let concurrent_collisions_total = IntCounterVec::new(
            Opts::new(
                "idempotency_concurrent_collisions_total",
                "Requests rejected because the key was in flight",
            ),
            request_labels,
        )?;
        let lock_acquisition_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "idempotency_lock_acquisition_duration_seconds",
                "Key acquisition duration seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            request_labels,
        )?;
        let storage_errors_total = IntCounterVec::new(
            Opts::new("idempotency_storage_errors_total", "Key store failures"),
            &["service", "operation"],
        )?;

        let dedup_hits_total = IntCounterVec::new(
            Opts::new("message_dedup_hits_total", "Duplicate messages skipped"),
            message_labels,
        )?;
        let dedup_misses_total = IntCounterVec::new(
            Opts::new("message_dedup_misses_total", "New messages processed"),
            message_labels,
        )?;
        let dedup_errors_total = IntCounterVec::new(
            Opts::new("message_dedup_errors_total", "Dedup store failures"),
            message_labels,
        )?;

        registry.register(Box::new(hits_total.clone()))?;
        registry.register(Box::new(misses_total.clone()))?;
        registry.register(Box::new(parameter_mismatches_total.clone()))?;
        registry.register(Box::new(concurrent_collisions_total.clone()))?;
        registry.register(Box::new(lock_acquisition_duration_seconds.clone()))?;
        registry.register(Box::new(storage_errors_total.clone()))?;
        registry.register(Box::new(dedup_hits_total.clone()))?;
        registry.register(Box::new(dedup_misses_total.clone()))?;
        registry.register(Box::new(dedup_errors_total.clone()))?;

        Ok(Self {
            hits_total,
            misses_total,
            parameter_mismatches_total,
            concurrent_collisions_total,
            lock_acquisition_duration_seconds,
            storage_errors_total,
            dedup_hits_total,
            dedup_misses_total,
            dedup_errors_total,
        })
    }

    /// Lock contention: in-flight collisions over all keyed requests
    pub fn contention_rate(&self, service: &str, path: &str, method: &str) -> f64 {
        let labels = [service, path, method];
        let collisions = self.concurrent_collisions_total.with_label_values(&labels).get();
        let keyed = collisions
            + self.hits_total.with_label_values(&labels).get()
            + self.misses_total.with_label_values(&labels).get()
            + self.parameter_mismatches_total.with_label_values(&labels).get();
        if keyed == 0 {
            0.0
        } else {
            collisions as f64 / keyed as f64
        }
    }
}
