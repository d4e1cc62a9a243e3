//! Order service
//!
//! Reference wiring of the platform's reliable-messaging pieces: the order
//! aggregate is saved together with its outbox records, the outbox relay
//! publishes them to `orders.events`, and order commands run behind the
//! idempotency gate.

pub mod config;
pub mod domain;
pub mod events;
pub mod health;
pub mod metrics;
pub mod repos;
pub mod routes;
