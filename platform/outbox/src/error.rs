use event_bus::EnvelopeError;
use uuid::Uuid;

/// Errors from the outbox write path and relay-side store operations
///
/// On the write path (`save_all` + commit) every variant means nothing was
/// committed: neither the aggregate change nor its events. Once a
/// [`crate::CommitReceipt`] has been returned, later failures only delay
/// publication; the relay retries them.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("transaction aborted, nothing committed: {0}")]
    Aborted(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("outbox record {0} not found")]
    NotFound(Uuid),

    #[error("duplicate event id {0}")]
    DuplicateEventId(Uuid),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("event type {0} is not registered")]
    UnregisteredEventType(String),

    #[error("event registered as {0} has a different concrete type")]
    EventTypeMismatch(String),
}

impl OutboxError {
    /// Map a driver error raised while inserting `event_id`
    pub(crate) fn on_insert(event_id: Uuid, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                OutboxError::DuplicateEventId(event_id)
            }
            _ => OutboxError::Database(err),
        }
    }
}
