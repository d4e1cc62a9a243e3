use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use outbox::{OutboxError, OutboxHealth, OutboxStats, OutboxStore};

use crate::routes::AppState;

/// Read-only view of an outbox backend, usable behind `dyn`
#[async_trait]
pub trait OutboxStatsSource: Send + Sync {
    async fn outbox_stats(&self) -> Result<OutboxStats, OutboxError>;
}

#[async_trait]
impl<S: OutboxStore> OutboxStatsSource for S {
    async fn outbox_stats(&self) -> Result<OutboxStats, OutboxError> {
        self.stats().await
    }
}

/// Health check endpoint handler
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.outbox.outbox_stats().await {
        Ok(stats) => {
            state.metrics.outbox.observe_stats(&stats);
            let outbox = OutboxHealth::from_stats(&stats, Utc::now(), state.outbox_max_lag);
            let status = if outbox.is_healthy() { "healthy" } else { "degraded" };
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": status,
                    "service": "orders-rs",
                    "version": env!("CARGO_PKG_VERSION"),
                    "outbox": outbox,
                })),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "Outbox stats unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "service": "orders-rs",
                    "version": env!("CARGO_PKG_VERSION"),
                })),
            )
        }
    }
}
