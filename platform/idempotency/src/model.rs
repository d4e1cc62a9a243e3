use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Locked,
    Completed,
    Failed,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Locked => "locked",
            KeyStatus::Completed => "completed",
            KeyStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "locked" => Some(KeyStatus::Locked),
            "completed" => Some(KeyStatus::Completed),
            "failed" => Some(KeyStatus::Failed),
            _ => None,
        }
    }
}

/// Cached handler response, replayed verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// One key per (`service_name`, `key`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKeyRecord {
    pub service_name: String,
    pub key: String,
    pub request_fingerprint: String,
    pub status: KeyStatus,
    /// Identifies the execution holding the lock
    pub lock_token: Uuid,
    pub lock_expires_at: DateTime<Utc>,
    /// Only set for `Completed` records whose response fit the size cap
    pub response: Option<ResponseSnapshot>,
    /// Last phase checkpointed by an execution of this request
    pub recovery_point: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// How long acquired keys stay locked and retained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub lock_timeout: Duration,
    pub retention: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl LockPolicy {
    pub fn lock_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_duration(self.lock_timeout)
    }

    pub fn retention_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_duration(self.retention)
    }
}

/// Proof of acquisition, required to complete or fail the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLease {
    pub service_name: String,
    pub key: String,
    pub token: Uuid,
    pub lock_expires_at: DateTime<Utc>,
    /// Phase reached by an earlier failed or abandoned execution of the same request
    pub recovery_point: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Caller now owns the key and must run the command
    Acquired(KeyLease),
    /// Another execution holds the lock until `lock_expires_at`
    DuplicateInFlight { lock_expires_at: DateTime<Utc> },
    /// Already executed with this request; replay the snapshot
    DuplicateCompleted(ResponseSnapshot),
    /// Key was used for a different request
    FingerprintConflict,
}

/// What to do with an existing record when a request arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Reacquire,
    Existing(AcquireOutcome),
}

impl IdempotencyKeyRecord {
    pub(crate) fn new_locked(
        service_name: &str,
        key: &str,
        fingerprint: &str,
        policy: &LockPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            key: key.to_string(),
            request_fingerprint: fingerprint.to_string(),
            status: KeyStatus::Locked,
            lock_token: Uuid::new_v4(),
            lock_expires_at: policy.lock_expiry(now),
            response: None,
            recovery_point: None,
            created_at: now,
            completed_at: None,
            expires_at: policy.retention_expiry(now),
        }
    }

    pub(crate) fn lease(&self) -> KeyLease {
        KeyLease {
            service_name: self.service_name.clone(),
            key: self.key.clone(),
            token: self.lock_token,
            lock_expires_at: self.lock_expires_at,
            recovery_point: self.recovery_point.clone(),
        }
    }

    /// Retention is over or the executing request died holding the lock.
    /// Such a record is taken over whatever request arrives.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
            || (self.status == KeyStatus::Locked && self.lock_expires_at <= now)
    }

    pub(crate) fn verdict(&self, fingerprint: &str, now: DateTime<Utc>) -> Verdict {
        if self.is_abandoned(now) {
            return Verdict::Reacquire;
        }
        if self.request_fingerprint != fingerprint {
            return Verdict::Existing(AcquireOutcome::FingerprintConflict);
        }
        match (&self.status, &self.response) {
            (KeyStatus::Completed, Some(snapshot)) => {
                Verdict::Existing(AcquireOutcome::DuplicateCompleted(snapshot.clone()))
            }
            // Failed, or completed with a response too large to cache
            (KeyStatus::Failed, _) | (KeyStatus::Completed, None) => Verdict::Reacquire,
            (KeyStatus::Locked, _) => Verdict::Existing(AcquireOutcome::DuplicateInFlight {
                lock_expires_at: self.lock_expires_at,
            }),
        }
    }

    /// Recovery point a takeover by `fingerprint` continues from; only a
    /// retry of the same request within retention resumes
    pub(crate) fn inherited_recovery_point(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if self.expires_at > now && self.request_fingerprint == fingerprint {
            self.recovery_point.clone()
        } else {
            None
        }
    }

    pub(crate) fn holds(&self, lease: &KeyLease) -> bool {
        self.status == KeyStatus::Locked && self.lock_token == lease.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked(now: DateTime<Utc>) -> IdempotencyKeyRecord {
        IdempotencyKeyRecord::new_locked("order-service", "k1", "fp", &LockPolicy::default(), now)
    }

    fn snapshot() -> ResponseSnapshot {
        ResponseSnapshot {
            status: 201,
            headers: BTreeMap::new(),
            body: b"{}".to_vec(),
        }
    }

    #[test]
    fn fresh_lock_is_in_flight_for_same_request() {
        let now = Utc::now();
        assert_eq!(
            locked(now).verdict("fp", now),
            Verdict::Existing(AcquireOutcome::DuplicateInFlight {
                lock_expires_at: now + chrono::Duration::minutes(5)
            })
        );
    }

    #[test]
    fn fingerprint_mismatch_wins_over_in_flight_and_completed() {
        let now = Utc::now();
        let mut record = locked(now);
        assert_eq!(
            record.verdict("other", now),
            Verdict::Existing(AcquireOutcome::FingerprintConflict)
        );

        record.status = KeyStatus::Completed;
        record.response = Some(snapshot());
        assert_eq!(
            record.verdict("other", now),
            Verdict::Existing(AcquireOutcome::FingerprintConflict)
        );
        assert_eq!(
            record.verdict("fp", now),
            Verdict::Existing(AcquireOutcome::DuplicateCompleted(snapshot()))
        );
    }

    #[test]
    fn reacquirable_states() {
        let now = Utc::now();

        let expired_lock = locked(now - chrono::Duration::minutes(6));
        assert_eq!(expired_lock.verdict("fp", now), Verdict::Reacquire);
        assert_eq!(expired_lock.verdict("other", now), Verdict::Reacquire);

        let mut failed = locked(now);
        failed.status = KeyStatus::Failed;
        assert_eq!(failed.verdict("fp", now), Verdict::Reacquire);

        let mut oversized = locked(now);
        oversized.status = KeyStatus::Completed;
        assert_eq!(oversized.verdict("fp", now), Verdict::Reacquire);

        let mut retired = locked(now - chrono::Duration::hours(25));
        retired.status = KeyStatus::Completed;
        retired.response = Some(snapshot());
        assert_eq!(retired.verdict("other", now), Verdict::Reacquire);
    }

    #[test]
    fn failed_and_uncached_keys_still_check_the_fingerprint() {
        let now = Utc::now();

        let mut failed = locked(now);
        failed.status = KeyStatus::Failed;
        assert_eq!(
            failed.verdict("other", now),
            Verdict::Existing(AcquireOutcome::FingerprintConflict)
        );

        let mut oversized = locked(now);
        oversized.status = KeyStatus::Completed;
        assert_eq!(
            oversized.verdict("other", now),
            Verdict::Existing(AcquireOutcome::FingerprintConflict)
        );
    }

    #[test]
    fn only_the_same_request_resumes_from_a_recovery_point() {
        let now = Utc::now();
        let mut failed = locked(now);
        failed.status = KeyStatus::Failed;
        failed.recovery_point = Some("stock_reserved".into());

        assert_eq!(
            failed.inherited_recovery_point("fp", now).as_deref(),
            Some("stock_reserved")
        );
        assert_eq!(failed.inherited_recovery_point("other", now), None);

        let mut retired = failed.clone();
        retired.expires_at = now - chrono::Duration::seconds(1);
        assert_eq!(retired.inherited_recovery_point("fp", now), None);
    }

    #[test]
    fn lease_matches_only_the_locking_execution() {
        let now = Utc::now();
        let record = locked(now);
        let lease = record.lease();
        assert!(record.holds(&lease));

        let other = KeyLease {
            token: Uuid::new_v4(),
            ..lease
        };
        assert!(!record.holds(&other));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [KeyStatus::Locked, KeyStatus::Completed, KeyStatus::Failed] {
            assert_eq!(KeyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(KeyStatus::parse("pending"), None);
    }
}
