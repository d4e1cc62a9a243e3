use async_trait::async_trait;
use outbox::{CommitReceipt, EventRegistry, OutboxError, OutboxStore, PgOutboxStore};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;

use super::{OrderRepository, RepoError};
use crate::domain::Order;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id     TEXT PRIMARY KEY,
    customer_id  TEXT NOT NULL,
    status       TEXT NOT NULL,
    version      INTEGER NOT NULL,
    document     JSONB NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_customer_id ON orders (customer_id);
"#;

pub struct PgOrderRepository {
    store: PgOutboxStore,
    registry: Arc<EventRegistry>,
}

impl PgOrderRepository {
    pub fn new(store: PgOutboxStore, registry: Arc<EventRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Create the orders table and the outbox table
    pub async fn ensure_schema(&self) -> Result<(), RepoError> {
        sqlx::raw_sql(SCHEMA).execute(self.store.pool()).await?;
        self.store.ensure_schema().await?;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn save(&self, order: &mut Order) -> Result<CommitReceipt, RepoError> {
        let events = order.pending();
        let records = self.registry.to_records(&events)?;
        let status = serde_json::to_value(order.status)?;
        let status = status.as_str().unwrap_or("unknown").to_string();

        let mut tx = self.store.begin().await?;

        // Insert when new; otherwise update only from the version we loaded
        let written = sqlx::query(
            r#"
            INSERT INTO orders
                (order_id, customer_id, status, version, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO UPDATE SET
                status = EXCLUDED.status,
                version = EXCLUDED.version,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            WHERE orders.version = $8 AND $8 > 0
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.customer_id)
        .bind(&status)
        .bind(order.version as i32)
        .bind(Json(&*order))
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.persisted_version() as i32)
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepoError::Conflict(order.order_id.clone()));
        }

        self.store.save_all(&mut tx, &records).await?;
        tx.commit()
            .await
            .map_err(|e| OutboxError::Aborted(e.to_string()))?;

        order.mark_persisted();
        Ok(CommitReceipt {
            event_ids: records.iter().map(|r| r.event_id).collect(),
        })
    }

    async fn find(&self, order_id: &str) -> Result<Option<Order>, RepoError> {
        let row: Option<Json<Order>> =
            sqlx::query_scalar("SELECT document FROM orders WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(self.store.pool())
                .await?;

        Ok(row.map(|Json(mut order)| {
            order.mark_persisted();
            order
        }))
    }
}
