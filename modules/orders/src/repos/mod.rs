//! Order persistence
//!
//! Both backends write the order document and its outbox records in one
//! transaction: either the new order state and every event it recorded are
//! visible after `save`, or neither is.

mod memory;
mod postgres;

pub use memory::InMemoryOrderRepository;
pub use postgres::PgOrderRepository;

use async_trait::async_trait;
use outbox::{CommitReceipt, OutboxError};

use crate::domain::Order;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Another writer changed the order first, or the id is taken
    #[error("order {0} was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt order document: {0}")]
    Document(#[from] serde_json::Error),
}

impl RepoError {
    /// Nothing was committed; the caller may retry the whole command
    pub fn is_aborted(&self) -> bool {
        matches!(self, RepoError::Conflict(_) | RepoError::Outbox(OutboxError::Aborted(_)))
    }
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist `order` and drain its pending events into the outbox
    async fn save(&self, order: &mut Order) -> Result<CommitReceipt, RepoError>;

    async fn find(&self, order_id: &str) -> Result<Option<Order>, RepoError>;
}
