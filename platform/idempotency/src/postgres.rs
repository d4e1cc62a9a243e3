//! Postgres-backed idempotency key store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::model::Verdict;
use crate::{
    AcquireOutcome, IdempotencyError, IdempotencyKeyRecord, KeyLease, KeyStatus, KeyStore,
    LockPolicy, ResponseSnapshot,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    service_name        TEXT NOT NULL,
    idem_key            TEXT NOT NULL,
    request_fingerprint TEXT NOT NULL,
    status              TEXT NOT NULL CHECK (status IN ('locked', 'completed', 'failed')),
    lock_token          UUID NOT NULL,
    lock_expires_at     TIMESTAMPTZ NOT NULL,
    response_status     INTEGER,
    response_headers    JSONB,
    response_body       BYTEA,
    recovery_point      TEXT,
    created_at          TIMESTAMPTZ NOT NULL,
    completed_at        TIMESTAMPTZ,
    expires_at          TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (service_name, idem_key)
);

ALTER TABLE idempotency_keys ADD COLUMN IF NOT EXISTS recovery_point TEXT;

CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at
    ON idempotency_keys (expires_at);

CREATE INDEX IF NOT EXISTS idx_idempotency_keys_locked
    ON idempotency_keys (lock_expires_at) WHERE status = 'locked';
"#;

/// Takes over the existing row only when it is abandoned, or failed or
/// uncached for this same request; otherwise no `RETURNING` row. A retry of
/// the same request keeps the recovery point of the attempt it replaces.
const ACQUIRE: &str = r#"
INSERT INTO idempotency_keys
    (service_name, idem_key, request_fingerprint, status, lock_token, lock_expires_at,
     created_at, expires_at)
VALUES ($1, $2, $3, 'locked', $4, $5, $6, $7)
ON CONFLICT (service_name, idem_key) DO UPDATE SET
    request_fingerprint = EXCLUDED.request_fingerprint,
    status = 'locked',
    lock_token = EXCLUDED.lock_token,
    lock_expires_at = EXCLUDED.lock_expires_at,
    response_status = NULL,
    response_headers = NULL,
    response_body = NULL,
    recovery_point = CASE
        WHEN idempotency_keys.expires_at > $6
         AND idempotency_keys.request_fingerprint = EXCLUDED.request_fingerprint
        THEN idempotency_keys.recovery_point
    END,
    created_at = EXCLUDED.created_at,
    completed_at = NULL,
    expires_at = EXCLUDED.expires_at
WHERE idempotency_keys.expires_at <= $6
   OR (idempotency_keys.status = 'locked' AND idempotency_keys.lock_expires_at <= $6)
   OR (idempotency_keys.request_fingerprint = EXCLUDED.request_fingerprint
       AND (idempotency_keys.status = 'failed'
            OR (idempotency_keys.status = 'completed' AND idempotency_keys.response_status IS NULL)))
RETURNING lock_token, recovery_point
"#;

/// The row can vanish (purge) between the upsert and the follow-up read
const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, FromRow)]
struct KeyRow {
    service_name: String,
    idem_key: String,
    request_fingerprint: String,
    status: String,
    lock_token: Uuid,
    lock_expires_at: DateTime<Utc>,
    response_status: Option<i32>,
    response_headers: Option<Json<BTreeMap<String, String>>>,
    response_body: Option<Vec<u8>>,
    recovery_point: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<KeyRow> for IdempotencyKeyRecord {
    type Error = IdempotencyError;

    fn try_from(row: KeyRow) -> Result<Self, Self::Error> {
        let status = KeyStatus::parse(&row.status)
            .ok_or_else(|| IdempotencyError::Corrupt(format!("unknown status {}", row.status)))?;

        let response = match row.response_status {
            Some(code) => Some(ResponseSnapshot {
                status: u16::try_from(code)
                    .map_err(|_| IdempotencyError::Corrupt(format!("status code {code}")))?,
                headers: row.response_headers.map(|h| h.0).unwrap_or_default(),
                body: row.response_body.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(IdempotencyKeyRecord {
            service_name: row.service_name,
            key: row.idem_key,
            request_fingerprint: row.request_fingerprint,
            status,
            lock_token: row.lock_token,
            lock_expires_at: row.lock_expires_at,
            response,
            recovery_point: row.recovery_point,
            created_at: row.created_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if missing
    pub async fn ensure_schema(&self) -> Result<(), IdempotencyError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        service_name: &str,
        key: &str,
    ) -> Result<Option<IdempotencyKeyRecord>, IdempotencyError> {
        let row = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT service_name, idem_key, request_fingerprint, status, lock_token,
                   lock_expires_at, response_status, response_headers, response_body,
                   recovery_point, created_at, completed_at, expires_at
            FROM idempotency_keys
            WHERE service_name = $1 AND idem_key = $2
            "#,
        )
        .bind(service_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IdempotencyKeyRecord::try_from).transpose()
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn try_acquire(
        &self,
        service_name: &str,
        key: &str,
        fingerprint: &str,
        policy: &LockPolicy,
    ) -> Result<AcquireOutcome, IdempotencyError> {
        let mut last_seen: Option<DateTime<Utc>> = None;

        for _ in 0..ACQUIRE_ATTEMPTS {
            let now = Utc::now();
            let token = Uuid::new_v4();
            let lock_expires_at = policy.lock_expiry(now);

            let acquired: Option<(Uuid, Option<String>)> = sqlx::query_as(ACQUIRE)
                .bind(service_name)
                .bind(key)
                .bind(fingerprint)
                .bind(token)
                .bind(lock_expires_at)
                .bind(now)
                .bind(policy.retention_expiry(now))
                .fetch_optional(&self.pool)
                .await?;

            if let Some((_, recovery_point)) = acquired {
                return Ok(AcquireOutcome::Acquired(KeyLease {
                    service_name: service_name.to_string(),
                    key: key.to_string(),
                    token,
                    lock_expires_at,
                    recovery_point,
                }));
            }

            let Some(existing) = self.fetch(service_name, key).await? else {
                continue;
            };
            match existing.verdict(fingerprint, Utc::now()) {
                Verdict::Existing(outcome) => return Ok(outcome),
                // Expired between the upsert and the read
                Verdict::Reacquire => last_seen = Some(existing.lock_expires_at),
            }
        }

        tracing::warn!(
            service = %service_name,
            key = %key,
            "Idempotency key kept changing during acquisition"
        );
        Ok(AcquireOutcome::DuplicateInFlight {
            lock_expires_at: last_seen.unwrap_or_else(|| policy.lock_expiry(Utc::now())),
        })
    }

    async fn complete(
        &self,
        lease: &KeyLease,
        response: Option<ResponseSnapshot>,
    ) -> Result<(), IdempotencyError> {
        let (status, headers, body) = match response {
            Some(snapshot) => (
                Some(i32::from(snapshot.status)),
                Some(Json(snapshot.headers)),
                Some(snapshot.body),
            ),
            None => (None, None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed',
                response_status = $4,
                response_headers = $5,
                response_body = $6,
                completed_at = NOW()
            WHERE service_name = $1 AND idem_key = $2 AND lock_token = $3 AND status = 'locked'
            "#,
        )
        .bind(&lease.service_name)
        .bind(&lease.key)
        .bind(lease.token)
        .bind(status)
        .bind(headers)
        .bind(body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::LeaseLost {
                key: lease.key.clone(),
            });
        }
        Ok(())
    }

    async fn fail(&self, lease: &KeyLease) -> Result<(), IdempotencyError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'failed'
            WHERE service_name = $1 AND idem_key = $2 AND lock_token = $3 AND status = 'locked'
            "#,
        )
        .bind(&lease.service_name)
        .bind(&lease.key)
        .bind(lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::LeaseLost {
                key: lease.key.clone(),
            });
        }
        Ok(())
    }

    async fn set_recovery_point(&self, lease: &KeyLease, phase: &str) -> Result<(), IdempotencyError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET recovery_point = $4
            WHERE service_name = $1 AND idem_key = $2 AND lock_token = $3 AND status = 'locked'
            "#,
        )
        .bind(&lease.service_name)
        .bind(&lease.key)
        .bind(lease.token)
        .bind(phase)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::LeaseLost {
                key: lease.key.clone(),
            });
        }
        Ok(())
    }

    async fn release_expired_locks(&self) -> Result<u64, IdempotencyError> {
        let result = sqlx::query(
            "UPDATE idempotency_keys SET status = 'failed' WHERE status = 'locked' AND lock_expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get(
        &self,
        service_name: &str,
        key: &str,
    ) -> Result<Option<IdempotencyKeyRecord>, IdempotencyError> {
        self.fetch(service_name, key).await
    }
}
