use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::BTreeMap;

use crate::{
    GateDecision, GateRejection, IdempotencyGate, KeyError, PhaseTracker, ResponseSnapshot,
};

pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
pub const HEADER_REPLAYED: &str = "Idempotent-Replayed";

/// Framing headers are recomputed by the server on replay
fn is_framing(name: &HeaderName) -> bool {
    *name == header::CONTENT_LENGTH
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONNECTION
}

/// Axum adapter for [`IdempotencyGate`]
///
/// Handlers that own a key find a [`PhaseTracker`] in the request extensions.
/// When `user_header` is configured, its value scopes the key to that user.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/orders", post(create_order))
///     .layer(middleware::from_fn_with_state(gate, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(gate): State<IdempotencyGate>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();

    // A key header that is not visible ASCII can never be a valid key
    let key = match parts.headers.get(HEADER_IDEMPOTENCY_KEY).map(HeaderValue::to_str) {
        Some(Err(_)) if gate.applies_to(&parts.method) => {
            return GateRejection::InvalidKey(KeyError::InvalidCharacters).into_response()
        }
        Some(Ok(key)) => Some(key.to_string()),
        _ => None,
    };

    // Unkeyed and safe requests are decided without reading the body
    if !gate.needs_body(&parts.method, key.as_deref()) {
        let decision = gate
            .begin(&parts.method, parts.uri.path(), key.as_deref(), &[])
            .await;
        return match decision {
            Ok(GateDecision::PassThrough) => next.run(Request::from_parts(parts, body)).await,
            Ok(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Unexpected idempotency decision",
            ),
            Err(rejection) => rejection.into_response(),
        };
    }

    let bytes = match to_bytes(body, gate.config().max_request_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "REQUEST_TOO_LARGE",
                "Request body exceeds the configured limit",
            )
        }
    };

    let user = gate
        .config()
        .user_header
        .as_deref()
        .and_then(|name| parts.headers.get(name))
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
    let decision = gate
        .begin_as(
            &parts.method,
            parts.uri.path(),
            key.as_deref(),
            user.as_deref(),
            &bytes,
        )
        .await;

    let mut req = Request::from_parts(parts, Body::from(bytes));
    let lease = match decision {
        Ok(GateDecision::PassThrough) => return next.run(req).await,
        Ok(GateDecision::Replay(snapshot)) => return replay(snapshot),
        Ok(GateDecision::Execute(lease)) => lease,
        Err(rejection) => return rejection.into_response(),
    };
    req.extensions_mut()
        .insert(PhaseTracker::new(gate.store().clone(), lease.clone()));

    let response = next.run(req).await;
    let (mut parts, body) = response.into_parts();

    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(key = %lease.key, error = %e, "Failed to buffer handler response");
            gate.abort(&lease).await;
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Failed to read handler response",
            );
        }
    };

    gate.finish(
        &lease,
        parts.status.as_u16(),
        snapshot_headers(&parts.headers),
        body.to_vec(),
    )
    .await;

    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(body))
}

fn snapshot_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if is_framing(name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn replay(snapshot: ResponseSnapshot) -> Response {
    let status = StatusCode::from_u16(snapshot.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(snapshot.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &snapshot.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers.insert(
        HeaderName::from_static("idempotent-replayed"),
        HeaderValue::from_static("true"),
    );
    response
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        match self {
            GateRejection::KeyRequired => error_response(
                StatusCode::BAD_REQUEST,
                "IDEMPOTENCY_KEY_REQUIRED",
                "Idempotency-Key header is required for this request",
            ),
            GateRejection::InvalidKey(err) => {
                let message = match err {
                    KeyError::Required => "Idempotency-Key header is empty".to_string(),
                    other => other.to_string(),
                };
                error_response(StatusCode::BAD_REQUEST, "IDEMPOTENCY_KEY_INVALID", &message)
            }
            GateRejection::InFlight { retry_after } => {
                let mut response = error_response(
                    StatusCode::CONFLICT,
                    "IDEMPOTENCY_CONCURRENT_REQUEST",
                    "A request with this idempotency key is already being processed",
                );
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            GateRejection::FingerprintMismatch => error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "IDEMPOTENCY_PARAMETER_MISMATCH",
                "Idempotency key was already used with a different request",
            ),
            GateRejection::StorageUnavailable => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "IDEMPOTENCY_STORAGE_UNAVAILABLE",
                "Idempotency storage is unavailable, retry later",
            ),
        }
    }
}
