//! PostgreSQL outbox tables.
//!
//! Each service owns one outbox table. Rows are staged through the caller's
//! open transaction and relayed in `position` order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::EventId;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::Result;
use crate::outbox::OutboxMessage;

/// Handle on one service's outbox table.
#[derive(Debug, Clone, Copy)]
pub struct PgOutbox {
    table: &'static str,
}

impl PgOutbox {
    /// `table` must be one of the outbox tables created by the migrations.
    pub const fn new(table: &'static str) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Inserts `message` inside `tx`. The row commits or rolls back with
    /// whatever else `tx` does.
    pub async fn stage(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> Result<()> {
        let headers = serde_json::to_value(&message.headers)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, aggregate_type, aggregate_id, event_type, payload, headers, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            self.table
        ))
        .bind(message.id.as_uuid())
        .bind(&message.aggregate_type)
        .bind(&message.aggregate_id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(headers)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn fetch_unpublished(&self, pool: &PgPool, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload, headers, created_at, published_at
            FROM {}
            WHERE published_at IS NULL
            ORDER BY position ASC
            LIMIT $1
            "#,
            self.table
        ))
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    pub async fn mark_published(&self, pool: &PgPool, id: EventId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET published_at = $2 WHERE id = $1 AND published_at IS NULL",
            self.table
        ))
        .bind(id.as_uuid())
        .bind(at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn for_aggregate(&self, pool: &PgPool, aggregate_id: &str) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload, headers, created_at, published_at
            FROM {}
            WHERE aggregate_id = $1
            ORDER BY position ASC
            "#,
            self.table
        ))
        .bind(aggregate_id)
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        let headers_json: serde_json::Value = row.try_get("headers")?;
        let headers: HashMap<String, String> = serde_json::from_value(headers_json)?;

        Ok(OutboxMessage {
            id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            headers,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}
