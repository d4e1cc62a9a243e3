//! Postgres-backed outbox store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{OutboxError, OutboxRecord, OutboxStats, OutboxStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id              BIGSERIAL PRIMARY KEY,
    event_id        UUID NOT NULL UNIQUE,
    event_type      TEXT NOT NULL,
    aggregate_type  TEXT NOT NULL,
    aggregate_id    TEXT NOT NULL,
    topic           TEXT NOT NULL,
    envelope        JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    published_at    TIMESTAMPTZ,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 10,
    last_error      TEXT,
    next_attempt_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_outbox_events_unpublished
    ON outbox_events (created_at, id) WHERE published_at IS NULL;

CREATE INDEX IF NOT EXISTS idx_outbox_events_aggregate
    ON outbox_events (aggregate_type, aggregate_id, created_at, id) WHERE published_at IS NULL;

CREATE INDEX IF NOT EXISTS idx_outbox_events_published_at
    ON outbox_events (published_at) WHERE published_at IS NOT NULL;
"#;

const COLUMNS: &str = "event_id, event_type, aggregate_type, aggregate_id, topic, envelope, \
                       created_at, published_at, retry_count, max_retries, last_error, next_attempt_at";

#[derive(Debug, FromRow)]
struct OutboxRow {
    event_id: Uuid,
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    topic: String,
    envelope: Json<EventEnvelope>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        OutboxRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            topic: row.topic,
            envelope: row.envelope.0,
            created_at: row.created_at,
            published_at: row.published_at,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
        }
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Outbox rows in the `outbox_events` table
///
/// The write path runs inside a caller-owned `sqlx::Transaction` so the
/// aggregate row and its events commit together.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if missing
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxError> {
        self.pool
            .begin()
            .await
            .map_err(|e| OutboxError::Aborted(format!("could not open transaction: {e}")))
    }

    pub async fn record(&self, event_id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(OutboxRecord::from))
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Tx = Transaction<'static, Postgres>;

    async fn save_all(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        records: &[OutboxRecord],
    ) -> Result<(), OutboxError> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO outbox_events
                    (event_id, event_type, aggregate_type, aggregate_id, topic, envelope,
                     created_at, retry_count, max_retries)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(record.event_id)
            .bind(&record.event_type)
            .bind(&record.aggregate_type)
            .bind(&record.aggregate_id)
            .bind(&record.topic)
            .bind(Json(&record.envelope))
            .bind(record.created_at)
            .bind(to_i32(record.retry_count))
            .bind(to_i32(record.max_retries))
            .execute(&mut **tx)
            .await
            .map_err(|e| OutboxError::on_insert(record.event_id, e))?;

            tracing::debug!(
                event_id = %record.event_id,
                event_type = %record.event_type,
                aggregate_id = %record.aggregate_id,
                "Event staged in outbox"
            );
        }

        Ok(())
    }

    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM outbox_events o
            WHERE o.published_at IS NULL
              AND o.retry_count < o.max_retries
              AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= NOW())
              AND NOT EXISTS (
                  SELECT 1 FROM outbox_events p
                  WHERE p.aggregate_type = o.aggregate_type
                    AND p.aggregate_id = o.aggregate_id
                    AND p.published_at IS NULL
                    AND (p.created_at, p.id) < (o.created_at, o.id)
                    AND (p.retry_count >= p.max_retries OR p.next_attempt_at > NOW())
              )
            ORDER BY o.created_at ASC, o.id ASC
            LIMIT $1
            "#
        ))
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = COALESCE(published_at, NOW())
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(event_id));
        }
        Ok(())
    }

    async fn increment_retry(
        &self,
        event_id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, OutboxError> {
        let updated: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                last_error = $2,
                next_attempt_at = $3
            WHERE event_id = $1 AND published_at IS NULL
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await?;

        let count = match updated {
            Some(count) => count,
            // Already published: report the count unchanged
            None => sqlx::query_scalar("SELECT retry_count FROM outbox_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(OutboxError::NotFound(event_id))?,
        };

        Ok(u32::try_from(count).unwrap_or(0))
    }

    async fn delete_published(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_poison(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM outbox_events
            WHERE published_at IS NULL AND retry_count >= max_retries
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        ))
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let (backlog, poison, published, total_retries, oldest): (
            i64,
            i64,
            i64,
            i64,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE published_at IS NULL),
                COUNT(*) FILTER (WHERE published_at IS NULL AND retry_count >= max_retries),
                COUNT(*) FILTER (WHERE published_at IS NOT NULL),
                COALESCE(SUM(retry_count) FILTER (WHERE published_at IS NULL), 0)::BIGINT,
                MIN(created_at) FILTER (WHERE published_at IS NULL)
            FROM outbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            backlog: backlog.max(0) as u64,
            poison: poison.max(0) as u64,
            published: published.max(0) as u64,
            total_retries: total_retries.max(0) as u64,
            oldest_unpublished_at: oldest,
        })
    }
}
