//! PostgreSQL outbox staging and relay tests.
//!
//! These tests share one PostgreSQL container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p messaging --test pg_outbox
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use messaging::events::PAYMENT_EVENTS;
use messaging::{
    EventBus, EventEnvelope, InMemoryEventBus, OutboxMessage, OutboxRelay, OutboxStore, PgOutbox,
    RelayConfig, RetryPolicy, SagaEvent,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const OUTBOX: PgOutbox = PgOutbox::new("payment_outbox");

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/003_create_payment_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE payment_outbox")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

/// Bare outbox store over the payment outbox table.
struct PgOutboxStore(PgPool);

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_unpublished(&self, limit: usize) -> messaging::Result<Vec<OutboxMessage>> {
        OUTBOX.fetch_unpublished(&self.0, limit).await
    }

    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> messaging::Result<()> {
        OUTBOX.mark_published(&self.0, id, at).await
    }

    async fn outbox_for_aggregate(&self, aggregate_id: &str) -> messaging::Result<Vec<OutboxMessage>> {
        OUTBOX.for_aggregate(&self.0, aggregate_id).await
    }
}

fn payment_event(order: &str, succeeded: bool) -> OutboxMessage {
    let id = OrderId::new(order);
    let event = if succeeded {
        SagaEvent::payment_succeeded(id)
    } else {
        SagaEvent::payment_failed(id)
    };
    OutboxMessage::from_envelope(&EventEnvelope::new(event)).unwrap()
}

#[tokio::test]
#[serial]
async fn test_rolled_back_stage_leaves_no_row() {
    let pool = get_test_pool().await;

    let mut tx = pool.begin().await.unwrap();
    OUTBOX.stage(&mut tx, &payment_event("o-1", true)).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(OUTBOX.fetch_unpublished(&pool, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_staged_row_round_trips_with_headers() {
    let pool = get_test_pool().await;
    let message = payment_event("o-1", true);

    let mut tx = pool.begin().await.unwrap();
    OUTBOX.stage(&mut tx, &message).await.unwrap();
    tx.commit().await.unwrap();

    let rows = OUTBOX.for_aggregate(&pool, "o-1").await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.id, message.id);
    assert_eq!(row.event_type, message.event_type);
    assert_eq!(row.payload, message.payload);
    assert_eq!(row.headers, message.headers);
    assert_eq!(row.topic().unwrap(), PAYMENT_EVENTS);
    assert!(row.published_at.is_none());
}

#[tokio::test]
#[serial]
async fn test_unpublished_rows_come_back_in_staging_order() {
    let pool = get_test_pool().await;
    let staged = vec![
        payment_event("o-1", true),
        payment_event("o-2", false),
        payment_event("o-3", true),
    ];
    for message in &staged {
        let mut tx = pool.begin().await.unwrap();
        OUTBOX.stage(&mut tx, message).await.unwrap();
        tx.commit().await.unwrap();
    }

    OUTBOX
        .mark_published(&pool, staged[1].id, Utc::now())
        .await
        .unwrap();

    let ids: Vec<EventId> = OUTBOX
        .fetch_unpublished(&pool, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![staged[0].id, staged[2].id]);
}

#[tokio::test]
#[serial]
async fn test_relay_publishes_committed_rows_only_once() {
    let pool = get_test_pool().await;
    for order in ["o-1", "o-2"] {
        let mut tx = pool.begin().await.unwrap();
        OUTBOX.stage(&mut tx, &payment_event(order, true)).await.unwrap();
        tx.commit().await.unwrap();
    }

    let bus = InMemoryEventBus::new(2);
    let relay = OutboxRelay::new(
        "payment",
        Arc::new(PgOutboxStore(pool.clone())),
        Arc::new(bus.clone()) as Arc<dyn EventBus>,
        RelayConfig {
            retry: RetryPolicy::no_retry(),
            ..RelayConfig::default()
        },
    );

    let first = relay.publish_pending().await.unwrap();
    let second = relay.publish_pending().await.unwrap();

    assert_eq!(first.published, 2);
    assert_eq!(second.published, 0);
    assert_eq!(bus.messages(PAYMENT_EVENTS).len(), 2);
    assert!(OUTBOX.fetch_unpublished(&pool, 10).await.unwrap().is_empty());
}
