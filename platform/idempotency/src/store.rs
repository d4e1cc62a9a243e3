use async_trait::async_trait;

use crate::{AcquireOutcome, IdempotencyError, IdempotencyKeyRecord, KeyLease, LockPolicy, ResponseSnapshot};

/// Durable home of idempotency keys
///
/// Every mutation is a single conditional write in the backend; callers never
/// read a record and then write it back.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Atomically create or take over the record for (`service_name`, `key`),
    /// or report why the caller must not execute.
    async fn try_acquire(
        &self,
        service_name: &str,
        key: &str,
        fingerprint: &str,
        policy: &LockPolicy,
    ) -> Result<AcquireOutcome, IdempotencyError>;

    /// Mark the leased key completed. `None` leaves nothing to replay, so the
    /// key can be acquired again.
    async fn complete(
        &self,
        lease: &KeyLease,
        response: Option<ResponseSnapshot>,
    ) -> Result<(), IdempotencyError>;

    /// Release the leased key after a failed execution so a retry can run
    async fn fail(&self, lease: &KeyLease) -> Result<(), IdempotencyError>;

    /// Record the last phase the leased execution finished, so a retry of
    /// the same request can skip it
    async fn set_recovery_point(&self, lease: &KeyLease, phase: &str) -> Result<(), IdempotencyError>;

    /// Move locked records past their lock expiry to `failed`
    async fn release_expired_locks(&self) -> Result<u64, IdempotencyError>;

    /// Delete records past their retention expiry
    async fn purge_expired(&self) -> Result<u64, IdempotencyError>;

    async fn get(
        &self,
        service_name: &str,
        key: &str,
    ) -> Result<Option<IdempotencyKeyRecord>, IdempotencyError>;
}
