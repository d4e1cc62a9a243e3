//! Order command and query endpoints
//!
//! - POST /api/orders: create an order, emitting `wms.order.received`
//! - POST /api/orders/{order_id}/cancel: cancel it, emitting `wms.order.cancelled`
//! - GET /api/orders/{order_id}

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::domain::{Order, OrderError, OrderLine};
use crate::repos::RepoError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Generated when absent
    #[serde(default)]
    pub order_id: Option<String>,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    /// Envelope ids written to the outbox by this command
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn not_found(order_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "ORDER_NOT_FOUND",
            message: format!("order {order_id} not found"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.code.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<OrderError> for ApiError {
    fn from(error: OrderError) -> Self {
        match error {
            OrderError::Validation(_) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "VALIDATION_ERROR",
                message: error.to_string(),
            },
            OrderError::AlreadyCancelled(_) => Self {
                status: StatusCode::CONFLICT,
                code: "ORDER_ALREADY_CANCELLED",
                message: error.to_string(),
            },
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(error: RepoError) -> Self {
        match &error {
            RepoError::Conflict(_) => Self {
                status: StatusCode::CONFLICT,
                code: "ORDER_CONFLICT",
                message: error.to_string(),
            },
            // Nothing was written; a retry with the same idempotency key will run again
            _ if error.is_aborted() => {
                tracing::warn!(error = %error, "Order write aborted");
                Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: "WRITE_ABORTED",
                    message: "Order was not saved, retry later".to_string(),
                }
            }
            _ => {
                tracing::error!(error = %error, "Order repository failure");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "INTERNAL_ERROR",
                    message: "Database error".to_string(),
                }
            }
        }
    }
}

/// Handler for POST /api/orders
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, ApiError> {
    let order_id = request
        .order_id
        .unwrap_or_else(|| format!("ORD-{}", Uuid::new_v4().simple()));
    let mut order = Order::create(order_id, request.customer_id, request.lines)?;

    let receipt = state.orders.save(&mut order).await?;
    state.metrics.orders_total.with_label_values(&["created"]).inc();
    tracing::info!(
        order_id = %order.order_id,
        customer_id = %order.customer_id,
        events = receipt.len(),
        "Order received"
    );

    let location = format!("/api/orders/{}", order.order_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(OrderResponse {
            order,
            event_ids: receipt.event_ids,
        }),
    )
        .into_response())
}

/// Handler for POST /api/orders/{order_id}/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(request): Json<CancelOrderRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let mut order = state
        .orders
        .find(&order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&order_id))?;

    order.cancel(request.reason)?;
    let receipt = state.orders.save(&mut order).await?;
    state.metrics.orders_total.with_label_values(&["cancelled"]).inc();
    tracing::info!(order_id = %order.order_id, "Order cancelled");

    Ok(Json(OrderResponse {
        order,
        event_ids: receipt.event_ids,
    }))
}

/// Handler for GET /api/orders/{order_id}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = state
        .orders
        .find(&order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&order_id))?;

    Ok(Json(OrderResponse {
        order,
        event_ids: Vec::new(),
    }))
}
