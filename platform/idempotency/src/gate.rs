//! Transport-agnostic core of the idempotent command gate
//!
//! [`IdempotencyGate::begin`] decides what to do with an incoming request;
//! after the handler runs, [`IdempotencyGate::finish`] records the outcome
//! against the lease. The axum middleware is a thin adapter over these two.

use axum::http::Method;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    is_mutating, normalize_key, scoped_fingerprint, validate_key, AcquireOutcome, IdempotencyConfig,
    IdempotencyError, IdempotencyMetrics, KeyError, KeyLease, KeyStore, ResponseSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Not gated: run the handler without touching the key store
    PassThrough,
    /// Caller owns the key; run the handler, then call `finish`
    Execute(KeyLease),
    /// Already executed; answer with the cached response
    Replay(ResponseSnapshot),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    KeyRequired,
    InvalidKey(KeyError),
    InFlight { retry_after: Duration },
    FingerprintMismatch,
    StorageUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Completed with a snapshot; retries replay it
    Cached,
    /// Completed without a snapshot; retries execute again
    Uncached,
    /// Handler failed; the key is free for a retry
    Released,
}

#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn KeyStore>,
    config: Arc<IdempotencyConfig>,
    metrics: Option<IdempotencyMetrics>,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn KeyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: IdempotencyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Whether requests with this method go through the gate at all
    pub fn applies_to(&self, method: &Method) -> bool {
        !self.config.only_mutating || is_mutating(method)
    }

    /// Whether [`IdempotencyGate::begin`] will fingerprint the request body.
    /// When it won't, the body can be passed to the handler unread.
    pub fn needs_body(&self, method: &Method, key_header: Option<&str>) -> bool {
        self.applies_to(method) && key_header.is_some_and(|k| !normalize_key(k).is_empty())
    }

    pub async fn begin(
        &self,
        method: &Method,
        path: &str,
        key_header: Option<&str>,
        body: &[u8],
    ) -> Result<GateDecision, GateRejection> {
        self.begin_as(method, path, key_header, None, body).await
    }

    /// Like [`IdempotencyGate::begin`], but a key first used by one user
    /// never replays for another: the user is part of the fingerprint.
    pub async fn begin_as(
        &self,
        method: &Method,
        path: &str,
        key_header: Option<&str>,
        user: Option<&str>,
        body: &[u8],
    ) -> Result<GateDecision, GateRejection> {
        if !self.applies_to(method) {
            return Ok(GateDecision::PassThrough);
        }

        let key = key_header.map(normalize_key).filter(|k| !k.is_empty());
        let Some(key) = key else {
            if self.config.require_key {
                return Err(GateRejection::KeyRequired);
            }
            return Ok(GateDecision::PassThrough);
        };
        validate_key(key, self.config.max_key_length).map_err(GateRejection::InvalidKey)?;

        let fp = scoped_fingerprint(method, path, user, body);
        let labels = [self.config.service_name.as_str(), path, method.as_str()];
        let started = Instant::now();

        let outcome = self
            .store
            .try_acquire(&self.config.service_name, key, &fp, &self.config.lock_policy())
            .await;

        if let Some(m) = &self.metrics {
            m.lock_acquisition_duration_seconds
                .with_label_values(&labels)
                .observe(started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(AcquireOutcome::Acquired(lease)) => {
                self.count(|m| &m.misses_total, &labels);
                tracing::debug!(service = %self.config.service_name, key = %key, "Idempotency key acquired");
                Ok(GateDecision::Execute(lease))
            }
            Ok(AcquireOutcome::DuplicateCompleted(snapshot)) => {
                self.count(|m| &m.hits_total, &labels);
                tracing::info!(service = %self.config.service_name, key = %key, "Replaying cached response");
                Ok(GateDecision::Replay(snapshot))
            }
            Ok(AcquireOutcome::DuplicateInFlight { lock_expires_at }) => {
                self.count(|m| &m.concurrent_collisions_total, &labels);
                let remaining = (lock_expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Err(GateRejection::InFlight {
                    retry_after: remaining.max(Duration::from_secs(1)),
                })
            }
            Ok(AcquireOutcome::FingerprintConflict) => {
                self.count(|m| &m.parameter_mismatches_total, &labels);
                tracing::warn!(
                    service = %self.config.service_name,
                    key = %key,
                    path = %path,
                    "Idempotency key reused with a different request"
                );
                Err(GateRejection::FingerprintMismatch)
            }
            Err(e) => {
                self.storage_error("acquire", &e);
                Err(GateRejection::StorageUnavailable)
            }
        }
    }

    /// Record the handler's response against the lease
    ///
    /// 5xx responses release the key; anything else completes it, caching the
    /// response when it fits `max_response_size`. Store failures are logged:
    /// the response has already been produced and is returned regardless.
    pub async fn finish(
        &self,
        lease: &KeyLease,
        status: u16,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> FinishOutcome {
        if status >= 500 {
            self.abort(lease).await;
            return FinishOutcome::Released;
        }

        let (snapshot, outcome) = if body.len() <= self.config.max_response_size {
            (
                Some(ResponseSnapshot {
                    status,
                    headers,
                    body,
                }),
                FinishOutcome::Cached,
            )
        } else {
            tracing::warn!(
                service = %self.config.service_name,
                key = %lease.key,
                size = body.len(),
                max = self.config.max_response_size,
                "Response too large to cache; retries of this key will execute again"
            );
            (None, FinishOutcome::Uncached)
        };

        if let Err(e) = self.store.complete(lease, snapshot).await {
            self.storage_error("complete", &e);
        }
        outcome
    }

    /// Release the lease after a failed execution
    pub async fn abort(&self, lease: &KeyLease) {
        if let Err(e) = self.store.fail(lease).await {
            self.storage_error("fail", &e);
        }
    }

    fn count<F>(&self, counter: F, labels: &[&str])
    where
        F: FnOnce(&IdempotencyMetrics) -> &prometheus::IntCounterVec,
    {
        if let Some(m) = &self.metrics {
            counter(m).with_label_values(labels).inc();
        }
    }

    fn storage_error(&self, operation: &str, error: &IdempotencyError) {
        if let Some(m) = &self.metrics {
            m.storage_errors_total
                .with_label_values(&[self.config.service_name.as_str(), operation])
                .inc();
        }
        tracing::error!(
            service = %self.config.service_name,
            operation = %operation,
            error = %error,
            "Idempotency store operation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryKeyStore;

    fn gate(config: IdempotencyConfig) -> (IdempotencyGate, InMemoryKeyStore) {
        let store = InMemoryKeyStore::new();
        (IdempotencyGate::new(Arc::new(store.clone()), config), store)
    }

    fn lease(decision: GateDecision) -> KeyLease {
        match decision {
            GateDecision::Execute(lease) => lease,
            other => panic!("expected Execute, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_and_unkeyed_requests_pass_through() {
        let (gate, store) = gate(IdempotencyConfig::new("order-service"));

        let get = gate.begin(&Method::GET, "/api/orders/1", Some("k1"), b"").await;
        assert_eq!(get, Ok(GateDecision::PassThrough));

        let post = gate.begin(&Method::POST, "/api/orders", None, b"{}").await;
        assert_eq!(post, Ok(GateDecision::PassThrough));

        let blank = gate.begin(&Method::POST, "/api/orders", Some("   "), b"{}").await;
        assert_eq!(blank, Ok(GateDecision::PassThrough));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn key_rules_are_enforced() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service").require_key(true));

        assert_eq!(
            gate.begin(&Method::POST, "/api/orders", None, b"{}").await,
            Err(GateRejection::KeyRequired)
        );
        assert_eq!(
            gate.begin(&Method::POST, "/api/orders", Some("bad key!"), b"{}").await,
            Err(GateRejection::InvalidKey(KeyError::InvalidCharacters))
        );
    }

    #[tokio::test]
    async fn finish_caches_and_replays() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service"));
        let first = lease(gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await.unwrap());

        let outcome = gate
            .finish(&first, 201, BTreeMap::new(), b"{\"id\":\"ORD-1\"}".to_vec())
            .await;
        assert_eq!(outcome, FinishOutcome::Cached);

        match gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await {
            Ok(GateDecision::Replay(snapshot)) => {
                assert_eq!(snapshot.status, 201);
                assert_eq!(snapshot.body, b"{\"id\":\"ORD-1\"}");
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_release_the_key() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service"));
        let first = lease(gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await.unwrap());

        let outcome = gate.finish(&first, 503, BTreeMap::new(), Vec::new()).await;
        assert_eq!(outcome, FinishOutcome::Released);

        let retry = gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await.unwrap();
        assert!(matches!(retry, GateDecision::Execute(_)));
    }

    #[tokio::test]
    async fn in_flight_reports_retry_after() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service"));
        lease(gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await.unwrap());

        match gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await {
            Err(GateRejection::InFlight { retry_after }) => {
                assert!(retry_after >= Duration::from_secs(1));
                assert!(retry_after <= Duration::from_secs(300));
            }
            other => panic!("expected in-flight rejection, got {other:?}"),
        }
    }

    #[test]
    fn body_is_only_needed_for_keyed_gated_requests() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service"));

        assert!(gate.needs_body(&Method::POST, Some("k1")));
        assert!(!gate.needs_body(&Method::POST, None));
        assert!(!gate.needs_body(&Method::POST, Some("  ")));
        assert!(!gate.needs_body(&Method::GET, Some("k1")));
    }

    #[tokio::test]
    async fn released_key_rejects_a_different_body() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service"));
        let first = lease(gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{}").await.unwrap());
        gate.finish(&first, 500, BTreeMap::new(), Vec::new()).await;

        assert_eq!(
            gate.begin(&Method::POST, "/api/orders", Some("k1"), b"{\"x\":1}").await,
            Err(GateRejection::FingerprintMismatch)
        );
    }

    #[tokio::test]
    async fn keys_do_not_replay_across_users() {
        let (gate, _) = gate(IdempotencyConfig::new("order-service"));
        let alice = lease(
            gate.begin_as(&Method::POST, "/api/orders", Some("k1"), Some("alice"), b"{}")
                .await
                .unwrap(),
        );
        gate.finish(&alice, 201, BTreeMap::new(), b"{}".to_vec()).await;

        assert_eq!(
            gate.begin_as(&Method::POST, "/api/orders", Some("k1"), Some("bob"), b"{}").await,
            Err(GateRejection::FingerprintMismatch)
        );
        assert!(matches!(
            gate.begin_as(&Method::POST, "/api/orders", Some("k1"), Some("alice"), b"{}").await,
            Ok(GateDecision::Replay(_))
        ));
    }
}
