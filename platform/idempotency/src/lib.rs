//! # Idempotency
//!
//! Makes retried commands safe on both sides of the broker.
//!
//! **HTTP commands.** Clients send an `Idempotency-Key` header. The
//! [`IdempotencyGate`] acquires the key in a [`KeyStore`] with one atomic
//! conditional write, runs the handler once, and caches its response so a
//! retry with the same key and body gets the original answer back.
//!
//! ```text
//! request ─► begin ─┬─ PassThrough ─────────────► handler
//!                   ├─ Execute(lease) ─► handler ─► finish (complete | fail)
//!                   ├─ Replay(snapshot) ─► cached response
//!                   └─ GateRejection ─► 400 / 409 / 422 / 503
//! ```
//!
//! Handlers with several side-effecting steps can checkpoint them through
//! the [`PhaseTracker`] the middleware puts in the request extensions, so a
//! retry after a crash resumes instead of repeating finished steps.
//!
//! **Event consumers.** [`DedupConsumer`] skips envelopes whose id a consumer
//! group has already processed, absorbing the duplicates the at-least-once
//! outbox relay can produce.
//!
//! The guarantee holds while a key's record exists: after `retention_period`
//! a reused key is a new request, and responses larger than
//! `max_response_size` are not cached.

mod cleanup;
mod config;
mod dedup;
mod error;
mod gate;
mod key;
mod memory;
mod metrics;
mod middleware;
mod model;
mod phases;
mod postgres;
mod store;

pub use cleanup::{CleanupHandle, CleanupReport, KeyCleanup};
pub use config::IdempotencyConfig;
pub use dedup::{
    DedupConsumer, DedupError, DedupOutcome, InMemoryProcessedStore, PgProcessedStore,
    ProcessedMessage, ProcessedMessageStore,
};
pub use error::{IdempotencyError, KeyError};
pub use gate::{FinishOutcome, GateDecision, GateRejection, IdempotencyGate};
pub use key::{fingerprint, is_mutating, normalize_key, scoped_fingerprint, validate_key};
pub use memory::InMemoryKeyStore;
pub use metrics::IdempotencyMetrics;
pub use middleware::{idempotency_middleware, HEADER_IDEMPOTENCY_KEY, HEADER_REPLAYED};
pub use model::{AcquireOutcome, IdempotencyKeyRecord, KeyLease, KeyStatus, LockPolicy, ResponseSnapshot};
pub use phases::PhaseTracker;
pub use postgres::PgKeyStore;
pub use store::KeyStore;
