use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, Method, Request, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use idempotency::{
    fingerprint, idempotency_middleware, AcquireOutcome, IdempotencyConfig, IdempotencyGate,
    IdempotencyMetrics, InMemoryKeyStore, KeyStatus, KeyStore, PhaseTracker, HEADER_REPLAYED,
};
use prometheus::Registry;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const SERVICE: &str = "order-service";

#[derive(Clone, Default)]
struct Handler {
    calls: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
    /// Recovery point each shipment attempt started from
    resumed_from: Arc<Mutex<Vec<Option<String>>>>,
}

struct TestApp {
    router: Router,
    store: InMemoryKeyStore,
    handler: Handler,
    metrics: IdempotencyMetrics,
}

impl TestApp {
    fn new(config: IdempotencyConfig) -> Self {
        let store = InMemoryKeyStore::new();
        let metrics = IdempotencyMetrics::new(&Registry::new()).unwrap();
        let gate = IdempotencyGate::new(Arc::new(store.clone()), config).with_metrics(metrics.clone());
        let handler = Handler::default();

        let h = handler.clone();
        let create = move |body: Bytes| {
            let h = h.clone();
            async move {
                let n = h.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if h.fail_next.swap(false, Ordering::SeqCst) {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "database down").into_response();
                }
                let echo: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                (
                    StatusCode::CREATED,
                    [("location", format!("/api/orders/ORD-{n}"))],
                    Json(json!({ "orderId": format!("ORD-{n}"), "request": echo })),
                )
                    .into_response()
            }
        };

        let h = handler.clone();
        let list = move || {
            let h = h.clone();
            async move {
                h.calls.fetch_add(1, Ordering::SeqCst);
                Json(json!({ "orders": [] }))
            }
        };

        let h = handler.clone();
        let ship = move |tracker: Option<Extension<PhaseTracker>>| {
            let h = h.clone();
            async move {
                h.calls.fetch_add(1, Ordering::SeqCst);
                let Some(Extension(tracker)) = tracker else {
                    return (StatusCode::CREATED, "unkeyed").into_response();
                };
                let mut tracker = tracker.with_phases(&["label_printed", "carrier_booked"]);
                h.resumed_from
                    .lock()
                    .unwrap()
                    .push(tracker.recovery_point().map(str::to_string));

                if !tracker.should_skip("label_printed") {
                    tracker.checkpoint("label_printed").await.unwrap();
                }
                if h.fail_next.swap(false, Ordering::SeqCst) {
                    return (StatusCode::BAD_GATEWAY, "carrier down").into_response();
                }
                tracker.checkpoint("carrier_booked").await.unwrap();
                (StatusCode::CREATED, "booked").into_response()
            }
        };

        let router = Router::new()
            .route("/api/orders", post(create).get(list))
            .route("/api/shipments", post(ship))
            .layer(from_fn_with_state(gate, idempotency_middleware));

        Self {
            router,
            store,
            handler,
            metrics,
        }
    }

    fn calls(&self) -> usize {
        self.handler.calls.load(Ordering::SeqCst)
    }

    async fn send(&self, method: Method, key: Option<&str>, body: &str) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        let mut request = Request::builder()
            .method(method)
            .uri("/api/orders")
            .header("content-type", "application/json");
        if let Some(key) = key {
            request = request.header("Idempotency-Key", key);
        }
        self.send_request(request.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn send_request(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        let response = tower::ServiceExt::oneshot(self.router.clone(), request)
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    async fn post(&self, key: Option<&str>, body: &str) -> (StatusCode, axum::http::HeaderMap, Bytes) {
        self.send(Method::POST, key, body).await
    }
}

fn error_code(body: &Bytes) -> String {
    let value: Value = serde_json::from_slice(body).unwrap();
    value["error"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn retry_with_same_key_replays_the_first_response() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    let body = r#"{"customerId":"C-1","lines":[{"sku":"SKU-1","qty":2}]}"#;

    let (status1, headers1, body1) = app.post(Some("k1"), body).await;
    let (status2, headers2, body2) = app.post(Some("k1"), body).await;

    assert_eq!(status1, StatusCode::CREATED);
    assert_eq!(status2, StatusCode::CREATED);
    assert_eq!(body1, body2);
    assert_eq!(headers2["location"], headers1["location"]);
    assert!(headers1.get(HEADER_REPLAYED).is_none());
    assert_eq!(headers2[HEADER_REPLAYED], "true");
    assert_eq!(app.calls(), 1);

    let labels = [SERVICE, "/api/orders", "POST"];
    assert_eq!(app.metrics.misses_total.with_label_values(&labels).get(), 1);
    assert_eq!(app.metrics.hits_total.with_label_values(&labels).get(), 1);
}

#[tokio::test]
async fn same_key_with_different_body_is_rejected() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));

    app.post(Some("k1"), r#"{"qty":1}"#).await;
    let (status, _, body) = app.post(Some("k1"), r#"{"qty":2}"#).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "IDEMPOTENCY_PARAMETER_MISMATCH");
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn in_flight_key_asks_the_client_to_retry() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    let body = r#"{"qty":1}"#;
    let fp = fingerprint(&Method::POST, "/api/orders", body.as_bytes());
    let held = app
        .store
        .try_acquire(SERVICE, "k1", &fp, &IdempotencyConfig::new(SERVICE).lock_policy())
        .await
        .unwrap();
    assert!(matches!(held, AcquireOutcome::Acquired(_)));

    let (status, headers, body) = app.post(Some("k1"), body).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "IDEMPOTENCY_CONCURRENT_REQUEST");
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=300).contains(&retry_after));
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn expired_lock_is_taken_over() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    let body = r#"{"qty":1}"#;
    let fp = fingerprint(&Method::POST, "/api/orders", body.as_bytes());
    app.store
        .try_acquire(SERVICE, "k1", &fp, &IdempotencyConfig::new(SERVICE).lock_policy())
        .await
        .unwrap();
    app.store.update(SERVICE, "k1", |r| {
        r.lock_expires_at = Utc::now() - chrono::Duration::seconds(1)
    });

    let (status, _, _) = app.post(Some("k1"), body).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(app.calls(), 1);

    let record = app.store.get(SERVICE, "k1").await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Completed);
}

#[tokio::test]
async fn purged_key_no_longer_replays() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    let body = r#"{"qty":1}"#;

    app.post(Some("k1"), body).await;
    app.store.update(SERVICE, "k1", |r| {
        r.expires_at = Utc::now() - chrono::Duration::seconds(1)
    });
    assert_eq!(app.store.purge_expired().await.unwrap(), 1);

    let (status, headers, _) = app.post(Some("k1"), body).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.get(HEADER_REPLAYED).is_none());
    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn oversized_response_executes_but_is_not_cached() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE).with_max_response_size(8));
    let body = r#"{"qty":1}"#;

    let (first, _, _) = app.post(Some("k1"), body).await;
    let (second, headers, _) = app.post(Some("k1"), body).await;

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(second, StatusCode::CREATED);
    assert!(headers.get(HEADER_REPLAYED).is_none());
    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn server_error_releases_the_key_for_a_retry() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    app.handler.fail_next.store(true, Ordering::SeqCst);
    let body = r#"{"qty":1}"#;

    let (first, _, _) = app.post(Some("k1"), body).await;
    assert_eq!(first, StatusCode::INTERNAL_SERVER_ERROR);
    let record = app.store.get(SERVICE, "k1").await.unwrap().unwrap();
    assert_eq!(record.status, KeyStatus::Failed);

    let (second, _, _) = app.post(Some("k1"), body).await;
    let (third, headers, _) = app.post(Some("k1"), body).await;
    assert_eq!(second, StatusCode::CREATED);
    assert_eq!(third, StatusCode::CREATED);
    assert_eq!(headers[HEADER_REPLAYED], "true");
    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn missing_key_passes_through_unless_required() {
    let optional = TestApp::new(IdempotencyConfig::new(SERVICE));
    let (status, _, _) = optional.post(None, "{}").await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(optional.store.is_empty());

    let required = TestApp::new(IdempotencyConfig::new(SERVICE).require_key(true));
    let (status, _, body) = required.post(None, "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "IDEMPOTENCY_KEY_REQUIRED");
    assert_eq!(required.calls(), 0);
}

#[tokio::test]
async fn malformed_key_is_rejected() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    let long = "k".repeat(256);

    for key in ["has space", "semi;colon", long.as_str()] {
        let (status, _, body) = app.post(Some(key), "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "key {key:?}");
        assert_eq!(error_code(&body), "IDEMPOTENCY_KEY_INVALID");
    }
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn safe_methods_bypass_the_gate() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE).require_key(true));

    let (status, _, _) = app.send(Method::GET, None, "").await;
    let (again, headers, _) = app.send(Method::GET, Some("k1"), "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, StatusCode::OK);
    assert!(headers.get(HEADER_REPLAYED).is_none());
    assert_eq!(app.calls(), 2);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn store_outage_fails_closed() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    app.store.set_available(false);

    let (status, _, body) = app.post(Some("k1"), "{}").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(&body), "IDEMPOTENCY_STORAGE_UNAVAILABLE");
    assert_eq!(app.calls(), 0);
    assert_eq!(
        app.metrics
            .storage_errors_total
            .with_label_values(&[SERVICE, "acquire"])
            .get(),
        1
    );
}

#[tokio::test]
async fn key_header_that_is_not_ascii_is_rejected() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    let request = Request::post("/api/orders")
        .header("Idempotency-Key", HeaderValue::from_bytes(b"k\xe9y").unwrap())
        .body(Body::from("{}"))
        .unwrap();

    let (status, _, body) = app.send_request(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "IDEMPOTENCY_KEY_INVALID");
    assert_eq!(app.calls(), 0);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn only_keyed_requests_are_held_to_the_request_size_limit() {
    let mut config = IdempotencyConfig::new(SERVICE);
    config.max_request_size = 16;
    let app = TestApp::new(config);
    let large = format!(r#"{{"note":"{}"}}"#, "x".repeat(64));

    let (unkeyed, _, _) = app.post(None, &large).await;
    let (read, _, _) = app.send(Method::GET, Some("k1"), &large).await;
    let (keyed, _, body) = app.post(Some("k1"), &large).await;

    assert_eq!(unkeyed, StatusCode::CREATED);
    assert_eq!(read, StatusCode::OK);
    assert_eq!(keyed, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&body), "REQUEST_TOO_LARGE");
    assert_eq!(app.calls(), 2);
}

#[tokio::test]
async fn uncached_key_still_rejects_a_different_body() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE).with_max_response_size(8));

    app.post(Some("k1"), r#"{"qty":1}"#).await;
    let (status, _, body) = app.post(Some("k1"), r#"{"qty":2}"#).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "IDEMPOTENCY_PARAMETER_MISMATCH");
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn released_key_still_rejects_a_different_body() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    app.handler.fail_next.store(true, Ordering::SeqCst);

    let (first, _, _) = app.post(Some("k1"), r#"{"qty":1}"#).await;
    let (second, _, body) = app.post(Some("k1"), r#"{"qty":2}"#).await;

    assert_eq!(first, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(second, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "IDEMPOTENCY_PARAMETER_MISMATCH");
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn retry_resumes_after_the_last_checkpoint() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE));
    app.handler.fail_next.store(true, Ordering::SeqCst);
    let ship = || {
        Request::post("/api/shipments")
            .header("Idempotency-Key", "ship-1")
            .body(Body::from(r#"{"orderId":"ORD-1"}"#))
            .unwrap()
    };

    let (first, _, _) = app.send_request(ship()).await;
    let record = app.store.get(SERVICE, "ship-1").await.unwrap().unwrap();
    assert_eq!(first, StatusCode::BAD_GATEWAY);
    assert_eq!(record.status, KeyStatus::Failed);
    assert_eq!(record.recovery_point.as_deref(), Some("label_printed"));

    let (second, _, _) = app.send_request(ship()).await;
    assert_eq!(second, StatusCode::CREATED);
    assert_eq!(
        *app.handler.resumed_from.lock().unwrap(),
        [None, Some("label_printed".to_string())]
    );
    let record = app.store.get(SERVICE, "ship-1").await.unwrap().unwrap();
    assert_eq!(record.recovery_point.as_deref(), Some("carrier_booked"));
}

#[tokio::test]
async fn keys_are_scoped_to_the_calling_user() {
    let app = TestApp::new(IdempotencyConfig::new(SERVICE).with_user_header("X-User-Id"));
    let create = |user: &str| {
        Request::post("/api/orders")
            .header("Idempotency-Key", "k1")
            .header("x-user-id", user)
            .body(Body::from("{}"))
            .unwrap()
    };

    let (first, _, _) = app.send_request(create("alice")).await;
    let (replayed, headers, _) = app.send_request(create("alice")).await;
    let (other_user, _, body) = app.send_request(create("bob")).await;

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(replayed, StatusCode::CREATED);
    assert_eq!(headers[HEADER_REPLAYED], "true");
    assert_eq!(other_user, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "IDEMPOTENCY_PARAMETER_MISMATCH");
    assert_eq!(app.calls(), 1);
}
