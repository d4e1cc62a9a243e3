//! # Transactional Outbox
//!
//! Domain events are written as [`OutboxRecord`]s inside the same local
//! transaction as the aggregate change that produced them. The
//! [`OutboxRelay`] later pushes them to the broker and marks them published.
//!
//! ```text
//! handler ──► repository.begin()
//!               ├─ aggregate document
//!               └─ store.save_all(&mut tx, records)
//!             tx.commit()  ──►  CommitReceipt { event_ids }
//!
//! relay loop ──► find_unpublished ─► bus.publish ─► mark_published
//!                                       └─ error ─► increment_retry (+ backoff)
//! ```
//!
//! Delivery is at-least-once. Consumers deduplicate on the envelope id, which
//! is also the record's `event_id`.
//!
//! Two stores ship with the crate: [`InMemoryOutboxStore`] for tests and
//! local development, and [`PgOutboxStore`] on sqlx/Postgres.

mod backoff;
mod config;
mod error;
mod health;
mod memory;
mod metrics;
mod postgres;
mod record;
mod registry;
mod relay;
mod store;

pub use backoff::BackoffPolicy;
pub use config::RelayConfig;
pub use error::OutboxError;
pub use health::{OutboxHealth, OutboxHealthStatus};
pub use memory::{InMemoryOutboxStore, MemoryTransaction};
pub use metrics::OutboxMetrics;
pub use postgres::PgOutboxStore;
pub use record::{CommitReceipt, OutboxRecord, OutboxStats, DEFAULT_MAX_RETRIES};
pub use registry::{DomainEvent, EventRegistry};
pub use relay::{BatchReport, OutboxRelay, RelayHandle, RelayStats};
pub use store::OutboxStore;
