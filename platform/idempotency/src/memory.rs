use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::model::Verdict;
use crate::{
    AcquireOutcome, IdempotencyError, IdempotencyKeyRecord, KeyLease, KeyStatus, KeyStore,
    LockPolicy, ResponseSnapshot,
};

type Records = HashMap<(String, String), IdempotencyKeyRecord>;

/// Key store for tests and single-process deployments
///
/// The whole map sits behind one mutex, so each operation is atomic.
/// [`InMemoryKeyStore::set_available`] simulates a storage outage.
#[derive(Debug, Clone)]
pub struct InMemoryKeyStore {
    records: Arc<Mutex<Records>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite a stored record in place; lets tests age records
    pub fn update<F>(&self, service_name: &str, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut IdempotencyKeyRecord),
    {
        let Ok(mut records) = self.lock() else {
            return false;
        };
        match records.get_mut(&(service_name.to_string(), key.to_string())) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, IdempotencyError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(IdempotencyError::Storage(
                "in-memory key store unavailable".to_string(),
            ));
        }
        Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn with_leased<F>(&self, lease: &KeyLease, f: F) -> Result<(), IdempotencyError>
    where
        F: FnOnce(&mut IdempotencyKeyRecord),
    {
        let mut records = self.lock()?;
        match records.get_mut(&(lease.service_name.clone(), lease.key.clone())) {
            Some(record) if record.holds(lease) => {
                f(record);
                Ok(())
            }
            _ => Err(IdempotencyError::LeaseLost {
                key: lease.key.clone(),
            }),
        }
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn try_acquire(
        &self,
        service_name: &str,
        key: &str,
        fingerprint: &str,
        policy: &LockPolicy,
    ) -> Result<AcquireOutcome, IdempotencyError> {
        let now = Utc::now();
        let mut records = self.lock()?;
        let id = (service_name.to_string(), key.to_string());

        let mut recovery_point = None;
        if let Some(existing) = records.get(&id) {
            if let Verdict::Existing(outcome) = existing.verdict(fingerprint, now) {
                return Ok(outcome);
            }
            recovery_point = existing.inherited_recovery_point(fingerprint, now);
        }

        let mut record =
            IdempotencyKeyRecord::new_locked(service_name, key, fingerprint, policy, now);
        record.recovery_point = recovery_point;
        let lease = record.lease();
        records.insert(id, record);
        Ok(AcquireOutcome::Acquired(lease))
    }

    async fn complete(
        &self,
        lease: &KeyLease,
        response: Option<ResponseSnapshot>,
    ) -> Result<(), IdempotencyError> {
        self.with_leased(lease, |record| {
            record.status = KeyStatus::Completed;
            record.response = response;
            record.completed_at = Some(Utc::now());
        })
    }

    async fn fail(&self, lease: &KeyLease) -> Result<(), IdempotencyError> {
        self.with_leased(lease, |record| {
            record.status = KeyStatus::Failed;
            record.response = None;
        })
    }

    async fn set_recovery_point(&self, lease: &KeyLease, phase: &str) -> Result<(), IdempotencyError> {
        self.with_leased(lease, |record| {
            record.recovery_point = Some(phase.to_string());
        })
    }

    async fn release_expired_locks(&self) -> Result<u64, IdempotencyError> {
        let now = Utc::now();
        let mut records = self.lock()?;
        let mut released = 0;
        for record in records.values_mut() {
            if record.status == KeyStatus::Locked && record.lock_expires_at <= now {
                record.status = KeyStatus::Failed;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let now = Utc::now();
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }

    async fn get(
        &self,
        service_name: &str,
        key: &str,
    ) -> Result<Option<IdempotencyKeyRecord>, IdempotencyError> {
        let records = self.lock()?;
        Ok(records
            .get(&(service_name.to_string(), key.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const SERVICE: &str = "order-service";

    fn snapshot(body: &str) -> ResponseSnapshot {
        ResponseSnapshot {
            status: 201,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: body.as_bytes().to_vec(),
        }
    }

    async fn acquire(store: &InMemoryKeyStore, key: &str, fp: &str) -> AcquireOutcome {
        store
            .try_acquire(SERVICE, key, fp, &LockPolicy::default())
            .await
            .unwrap()
    }

    fn lease(outcome: AcquireOutcome) -> KeyLease {
        match outcome {
            AcquireOutcome::Acquired(lease) => lease,
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_complete_replay() {
        let store = InMemoryKeyStore::new();
        let lease = lease(acquire(&store, "k1", "fp").await);

        assert!(matches!(
            acquire(&store, "k1", "fp").await,
            AcquireOutcome::DuplicateInFlight { .. }
        ));

        store.complete(&lease, Some(snapshot("{\"id\":1}"))).await.unwrap();
        assert_eq!(
            acquire(&store, "k1", "fp").await,
            AcquireOutcome::DuplicateCompleted(snapshot("{\"id\":1}"))
        );
        assert_eq!(
            acquire(&store, "k1", "other").await,
            AcquireOutcome::FingerprintConflict
        );
    }

    #[tokio::test]
    async fn keys_are_scoped_per_service() {
        let store = InMemoryKeyStore::new();
        lease(acquire(&store, "k1", "fp").await);
        let other = store
            .try_acquire("wave-service", "k1", "fp", &LockPolicy::default())
            .await
            .unwrap();
        assert!(matches!(other, AcquireOutcome::Acquired(_)));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn stale_lease_cannot_overwrite_new_execution() {
        let store = InMemoryKeyStore::new();
        let stale = lease(acquire(&store, "k1", "fp").await);

        store.update(SERVICE, "k1", |r| {
            r.lock_expires_at = Utc::now() - chrono::Duration::seconds(1)
        });
        let fresh = lease(acquire(&store, "k1", "fp").await);
        assert_ne!(stale.token, fresh.token);

        let err = store.complete(&stale, Some(snapshot("stale"))).await.unwrap_err();
        assert!(matches!(err, IdempotencyError::LeaseLost { .. }));
        assert!(store.fail(&stale).await.is_err());

        store.complete(&fresh, Some(snapshot("fresh"))).await.unwrap();
        let record = store.get(SERVICE, "k1").await.unwrap().unwrap();
        assert_eq!(record.response.unwrap().body, b"fresh");
    }

    #[tokio::test]
    async fn failed_and_uncached_keys_are_reacquirable() {
        let store = InMemoryKeyStore::new();

        let first = lease(acquire(&store, "k1", "fp").await);
        store.fail(&first).await.unwrap();
        let second = lease(acquire(&store, "k1", "fp").await);

        store.complete(&second, None).await.unwrap();
        assert!(matches!(
            acquire(&store, "k1", "fp").await,
            AcquireOutcome::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn failed_and_uncached_keys_reject_a_different_request() {
        let store = InMemoryKeyStore::new();

        let failed = lease(acquire(&store, "k1", "fp").await);
        store.fail(&failed).await.unwrap();
        assert_eq!(acquire(&store, "k1", "other").await, AcquireOutcome::FingerprintConflict);

        let uncached = lease(acquire(&store, "k2", "fp").await);
        store.complete(&uncached, None).await.unwrap();
        assert_eq!(acquire(&store, "k2", "other").await, AcquireOutcome::FingerprintConflict);
    }

    #[tokio::test]
    async fn retry_resumes_from_the_recovery_point() {
        let store = InMemoryKeyStore::new();

        let first = lease(acquire(&store, "k1", "fp").await);
        assert_eq!(first.recovery_point, None);
        store.set_recovery_point(&first, "stock_reserved").await.unwrap();
        store.fail(&first).await.unwrap();

        let second = lease(acquire(&store, "k1", "fp").await);
        assert_eq!(second.recovery_point.as_deref(), Some("stock_reserved"));

        // The old execution no longer holds the key
        let err = store.set_recovery_point(&first, "order_saved").await.unwrap_err();
        assert!(matches!(err, IdempotencyError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn maintenance_releases_locks_and_purges() {
        let store = InMemoryKeyStore::new();
        lease(acquire(&store, "abandoned", "fp").await);
        lease(acquire(&store, "old", "fp").await);
        lease(acquire(&store, "live", "fp").await);

        store.update(SERVICE, "abandoned", |r| {
            r.lock_expires_at = Utc::now() - chrono::Duration::seconds(1)
        });
        store.update(SERVICE, "old", |r| {
            r.expires_at = Utc::now() - chrono::Duration::seconds(1)
        });

        assert_eq!(store.release_expired_locks().await.unwrap(), 1);
        let abandoned = store.get(SERVICE, "abandoned").await.unwrap().unwrap();
        assert_eq!(abandoned.status, KeyStatus::Failed);

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(SERVICE, "old").await.unwrap().is_none());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn outage_surfaces_as_storage_error() {
        let store = InMemoryKeyStore::new();
        store.set_available(false);
        let err = store
            .try_acquire(SERVICE, "k1", "fp", &LockPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Storage(_)));
    }
}
