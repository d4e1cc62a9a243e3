use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{OutboxError, OutboxRecord, OutboxStats};

/// Durable home of outbox records
///
/// `Tx` is the backend's transaction handle. Repositories open it, write the
/// aggregate, call [`OutboxStore::save_all`] and commit; the records become
/// visible only with the aggregate change.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    type Tx: Send;

    /// Stage records in the caller's transaction
    async fn save_all(&self, tx: &mut Self::Tx, records: &[OutboxRecord])
        -> Result<(), OutboxError>;

    /// Up to `limit` records the relay may publish now.
    ///
    /// Returned in `(created_at, insertion)` order. A record is eligible when
    /// it is unpublished, below its retry budget and due, and no earlier
    /// unpublished record of the same aggregate is poison or still backing off.
    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Set `published_at`. Re-marking a published record keeps the first timestamp.
    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Record a failed attempt and return the new retry count
    async fn increment_retry(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, OutboxError>;

    /// Delete records published before `older_than`
    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Unpublished records whose retry budget is spent, oldest first
    async fn find_poison(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}
