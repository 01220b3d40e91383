use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use messaging::{OutboxMessage, OutboxStore, PgOutbox};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::Result;
use crate::payment::PaymentRecord;
use crate::store::PaymentStore;

const OUTBOX: PgOutbox = PgOutbox::new("payment_outbox");

/// PostgreSQL-backed payment store.
#[derive(Clone)]
pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: PgRow) -> Result<PaymentRecord> {
        let outcome: String = row.try_get("outcome")?;
        Ok(PaymentRecord {
            order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
            outcome: outcome.parse()?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn record(
        &self,
        record: &PaymentRecord,
        event: &OutboxMessage,
    ) -> Result<Option<PaymentRecord>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payments (order_id, outcome, recorded_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(record.order_id.as_str())
        .bind(record.outcome.as_str())
        .bind(record.recorded_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let row = sqlx::query(
                "SELECT order_id, outcome, recorded_at FROM payments WHERE order_id = $1",
            )
            .bind(record.order_id.as_str())
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(Some(Self::row_to_record(row)?));
        }

        OUTBOX.stage(&mut tx, event).await?;
        tx.commit().await?;
        Ok(None)
    }

    async fn get(&self, order_id: &OrderId) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query("SELECT order_id, outcome, recorded_at FROM payments WHERE order_id = $1")
            .bind(order_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_record).transpose()
    }
}

#[async_trait]
impl OutboxStore for PostgresPaymentStore {
    async fn fetch_unpublished(&self, limit: usize) -> messaging::Result<Vec<OutboxMessage>> {
        OUTBOX.fetch_unpublished(&self.pool, limit).await
    }

    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> messaging::Result<()> {
        OUTBOX.mark_published(&self.pool, id, at).await
    }

    async fn outbox_for_aggregate(&self, aggregate_id: &str) -> messaging::Result<Vec<OutboxMessage>> {
        OUTBOX.for_aggregate(&self.pool, aggregate_id).await
    }
}
