#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("idempotency key is required")]
    Required,

    #[error("idempotency key exceeds {max} characters")]
    TooLong { max: usize },

    #[error("idempotency key may only contain letters, digits, '-' and '_'")]
    InvalidCharacters,
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("idempotency storage unavailable: {0}")]
    Storage(String),

    /// The record no longer carries this lease's lock token: the lock expired
    /// and another execution took the key, or the record was purged.
    #[error("lease on idempotency key {key} was lost")]
    LeaseLost { key: String },

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}
