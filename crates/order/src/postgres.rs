use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId, Sku};
use messaging::{OutboxMessage, OutboxStore, PgOutbox};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::order::{Order, OrderItem};
use crate::status::OrderStatus;
use crate::store::{OrderStore, Transition};
use crate::{OrderError, Result};

const OUTBOX: PgOutbox = PgOutbox::new("order_outbox");

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the workspace migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    async fn items(&self, id: &OrderId) -> Result<Vec<OrderItem>> {
        let skus: Vec<String> = sqlx::query_scalar(
            "SELECT sku FROM order_items WHERE order_id = $1 ORDER BY line_no ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(skus
            .into_iter()
            .map(|sku| OrderItem {
                product_id: Sku::new(sku),
            })
            .collect())
    }

    async fn row_to_order(&self, row: PgRow) -> Result<Order> {
        let id = OrderId::new(row.try_get::<String, _>("id")?);
        let status: String = row.try_get("status")?;
        Ok(Order {
            items: self.items(&id).await?,
            id,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert_with_event(&self, order: &Order, event: &OutboxMessage) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(order.id.as_str())
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("orders_pkey")
            {
                return OrderError::Validation(format!("order {} already exists", order.id));
            }
            OrderError::Database(e)
        })?;

        for (line_no, item) in order.items.iter().enumerate() {
            sqlx::query("INSERT INTO order_items (order_id, line_no, sku) VALUES ($1, $2, $3)")
                .bind(order.id.as_str())
                .bind(line_no as i32)
                .bind(item.product_id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        OUTBOX.stage(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT id, status, created_at, updated_at FROM orders WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_order(row).await?)),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let updated = sqlx::query(
            r#"
            UPDATE orders SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING id, status, created_at, updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(Transition::Applied(self.row_to_order(row).await?));
        }

        match self.get(id).await? {
            Some(current) => Ok(Transition::Unchanged(current)),
            None => Err(OrderError::NotFound(id.clone())),
        }
    }

    async fn stale(&self, statuses: &[OrderStatus], before: DateTime<Utc>) -> Result<Vec<Order>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, status, created_at, updated_at FROM orders
            WHERE status = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            "#,
        )
        .bind(&names)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            orders.push(self.row_to_order(row).await?);
        }
        Ok(orders)
    }
}

#[async_trait]
impl OutboxStore for PostgresOrderStore {
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
