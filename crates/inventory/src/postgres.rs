use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId, Sku};
use messaging::{OutboxMessage, OutboxStore, PgOutbox};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::stock::{AttemptOutcome, StockItem, StockStatus};
use crate::store::{AttemptWrite, StockStore};
use crate::{LedgerError, Result};

const OUTBOX: PgOutbox = PgOutbox::new("inventory_outbox");

/// PostgreSQL-backed stock store.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_item(row: PgRow) -> Result<StockItem> {
        let status: String = row.try_get("status")?;
        let order_id: Option<String> = row.try_get("order_id")?;
        Ok(StockItem {
            sku: Sku::new(row.try_get::<String, _>("sku")?),
            status: status.parse()?,
            order_id: order_id.map(OrderId::new),
        })
    }

    fn sku_strings(skus: &[Sku]) -> Vec<String> {
        skus.iter().map(|s| s.as_str().to_string()).collect()
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn add_available(&self, skus: &[Sku]) -> Result<usize> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_items (sku, status, order_id)
            SELECT UNNEST($1::TEXT[]), 'Available', NULL
            ON CONFLICT (sku) DO NOTHING
            "#,
        )
        .bind(Self::sku_strings(skus))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get(&self, sku: &Sku) -> Result<Option<StockItem>> {
        let row = sqlx::query("SELECT sku, status, order_id FROM stock_items WHERE sku = $1")
            .bind(sku.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_item).transpose()
    }

    async fn list(&self) -> Result<Vec<StockItem>> {
        let rows = sqlx::query("SELECT sku, status, order_id FROM stock_items ORDER BY sku ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_item).collect()
    }

    async fn attempt_for(&self, order_id: &OrderId) -> Result<Option<AttemptOutcome>> {
        let outcome: Option<String> =
            sqlx::query_scalar("SELECT outcome FROM reservation_attempts WHERE order_id = $1")
                .bind(order_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        outcome.map(|o| o.parse()).transpose()
    }

    async fn reserve_all(
        &self,
        order_id: &OrderId,
        skus: &[Sku],
        outcome: &OutboxMessage,
    ) -> Result<AttemptWrite> {
        let mut tx = self.pool.begin().await?;

        // Claims the attempt first; a concurrent redelivery for the same order
        // waits here until this transaction ends.
        let claimed = sqlx::query(
            r#"
            INSERT INTO reservation_attempts (order_id, outcome)
            VALUES ($1, 'Reserved')
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_str())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            let previous: String =
                sqlx::query_scalar("SELECT outcome FROM reservation_attempts WHERE order_id = $1")
                    .bind(order_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(AttemptWrite::AlreadyRecorded(previous.parse()?));
        }

        let requested = Self::sku_strings(skus);

        // Locked in SKU order so overlapping reservations cannot deadlock.
        let rows = sqlx::query(
            r#"
            SELECT sku, status, order_id FROM stock_items
            WHERE sku = ANY($1)
            ORDER BY sku
            FOR UPDATE
            "#,
        )
        .bind(&requested)
        .fetch_all(&mut *tx)
        .await?;
        let locked = rows
            .into_iter()
            .map(Self::row_to_item)
            .collect::<Result<Vec<_>>>()?;

        let unavailable: Vec<Sku> = skus
            .iter()
            .filter(|sku| {
                !locked
                    .iter()
                    .any(|item| &item.sku == *sku && item.status == StockStatus::Available)
            })
            .cloned()
            .collect();
        if !unavailable.is_empty() {
            tx.rollback().await?;
            return Err(LedgerError::ReservationConflict {
                order_id: order_id.clone(),
                unavailable,
            });
        }

        let updated = sqlx::query(
            r#"
            UPDATE stock_items
            SET status = 'Reserved', order_id = $1, updated_at = NOW()
            WHERE sku = ANY($2) AND status = 'Available'
            "#,
        )
        .bind(order_id.as_str())
        .bind(&requested)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() as usize != skus.len() {
            tracing::warn!(
                %order_id,
                expected = skus.len(),
                updated = updated.rows_affected(),
                "lost reservation race, rolling back"
            );
            tx.rollback().await?;
            return Err(LedgerError::ReservationConflict {
                order_id: order_id.clone(),
                unavailable: Vec::new(),
            });
        }

        OUTBOX.stage(&mut tx, outcome).await?;
        tx.commit().await?;
        Ok(AttemptWrite::Recorded)
    }

    async fn record_rejection(
        &self,
        order_id: &OrderId,
        outcome: &OutboxMessage,
    ) -> Result<AttemptWrite> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO reservation_attempts (order_id, outcome)
            VALUES ($1, 'Rejected')
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_str())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            let previous: String =
                sqlx::query_scalar("SELECT outcome FROM reservation_attempts WHERE order_id = $1")
                    .bind(order_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(AttemptWrite::AlreadyRecorded(previous.parse()?));
        }

        OUTBOX.stage(&mut tx, outcome).await?;
        tx.commit().await?;
        Ok(AttemptWrite::Recorded)
    }

    async fn release_by_order(&self, order_id: &OrderId) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE stock_items
            SET status = 'Available', order_id = NULL, updated_at = NOW()
            WHERE order_id = $1 AND status = 'Reserved'
            "#,
        )
        .bind(order_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn mark_sold_by_order(&self, order_id: &OrderId) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE stock_items
            SET status = 'Sold', updated_at = NOW()
            WHERE order_id = $1 AND status = 'Reserved'
            "#,
        )
        .bind(order_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl OutboxStore for PostgresStockStore {
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
