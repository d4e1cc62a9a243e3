pub mod orders;

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use idempotency::{idempotency_middleware, IdempotencyGate};
use std::sync::Arc;
use std::time::Duration;

use crate::health::{health, OutboxStatsSource};
use crate::metrics::{track_http, ServiceMetrics};
use crate::repos::OrderRepository;

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<dyn OrderRepository>,
    pub outbox: Arc<dyn OutboxStatsSource>,
    pub metrics: ServiceMetrics,
    pub outbox_max_lag: Duration,
}

/// Order commands sit behind the idempotency gate; health and metrics do not
pub fn router(state: AppState, gate: IdempotencyGate) -> Router {
    let commands = Router::new()
        .route("/api/orders", post(orders::create_order))
        .route("/api/orders/{order_id}", get(orders::get_order))
        .route("/api/orders/{order_id}/cancel", post(orders::cancel_order))
        .layer(from_fn_with_state(gate, idempotency_middleware));

    Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .merge(commands)
        .layer(from_fn_with_state(state.metrics.clone(), track_http))
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e,
        ),
    }
}
