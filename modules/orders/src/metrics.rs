use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use idempotency::IdempotencyMetrics;
use outbox::OutboxMetrics;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Instant;

#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,

    pub orders_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    pub outbox: OutboxMetrics,
    pub idempotency: IdempotencyMetrics,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let orders_total = IntCounterVec::new(
            Opts::new("orders_total", "Order commands applied"),
            &["action"], // created|cancelled
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration seconds"),
            &["path", "method", "status"],
        )?;

        registry.register(Box::new(orders_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        let outbox = OutboxMetrics::new(&registry)?;
        let idempotency = IdempotencyMetrics::new(&registry)?;

        Ok(Self {
            registry,
            orders_total,
            http_request_duration_seconds,
            outbox,
            idempotency,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

/// Observe request duration by route template
pub async fn track_http(
    State(metrics): State<ServiceMetrics>,
    req: Request,
    next: Next,
) -> Response {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    metrics
        .http_request_duration_seconds
        .with_label_values(&[path.as_str(), method.as_str(), response.status().as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}
