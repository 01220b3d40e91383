//! PostgreSQL stock store tests.
//!
//! These tests share one PostgreSQL container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p inventory --test postgres_integration
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use common::{OrderId, Sku};
use inventory::{
    AttemptOutcome, AttemptWrite, LedgerError, PostgresStockStore, ReservationLedger, StockStatus,
};
use messaging::OutboxStore;
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

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
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_inventory_tables.sql"
            ))
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

async fn get_test_store(skus: &[&str]) -> PostgresStockStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE stock_items, reservation_attempts, inventory_outbox")
        .execute(&pool)
        .await
        .unwrap();

    let store = PostgresStockStore::new(pool);
    ReservationLedger::new(Arc::new(store.clone()))
        .seed(&skus.iter().map(|s| Sku::new(*s)).collect::<Vec<_>>())
        .await
        .unwrap();
    store
}

fn skus(names: &[&str]) -> Vec<Sku> {
    names.iter().map(|s| Sku::new(*s)).collect()
}

#[tokio::test]
#[serial]
async fn reserve_all_commits_rows_attempt_and_outbox_together() {
    let store = get_test_store(&["sku-1", "sku-2"]).await;
    let ledger = ReservationLedger::new(Arc::new(store.clone()));
    let order = OrderId::new("o-1");

    let write = ledger.reserve_all(&order, &skus(&["sku-1", "sku-2"])).await.unwrap();

    assert_eq!(write, AttemptWrite::Recorded);
    for item in ledger.list().await.unwrap() {
        assert_eq!(item.status, StockStatus::Reserved);
        assert!(item.is_owned_by(&order));
    }
    assert_eq!(
        ledger.attempt_for(&order).await.unwrap(),
        Some(AttemptOutcome::Reserved)
    );
    let staged = store.outbox_for_aggregate("o-1").await.unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].event_type, "InventoryReservationSucceeded");
    assert!(!staged[0].is_published());
}

#[tokio::test]
#[serial]
async fn conflict_rolls_back_everything() {
    let store = get_test_store(&["sku-1", "sku-3"]).await;
    let ledger = ReservationLedger::new(Arc::new(store.clone()));
    ledger
        .reserve_all(&OrderId::new("owner"), &skus(&["sku-3"]))
        .await
        .unwrap();

    let result = ledger
        .reserve_all(&OrderId::new("o-2"), &skus(&["sku-1", "sku-3"]))
        .await;

    match result {
        Err(LedgerError::ReservationConflict { unavailable, .. }) => {
            assert_eq!(unavailable, skus(&["sku-3"]))
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(ledger.item(&Sku::new("sku-1")).await.unwrap().unwrap().is_available());
    assert_eq!(ledger.attempt_for(&OrderId::new("o-2")).await.unwrap(), None);
    assert!(store.outbox_for_aggregate("o-2").await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn rejection_is_recorded_once() {
    let store = get_test_store(&["sku-3"]).await;
    let ledger = ReservationLedger::new(Arc::new(store.clone()));
    ledger
        .reserve_all(&OrderId::new("owner"), &skus(&["sku-3"]))
        .await
        .unwrap();
    let order = OrderId::new("o-2");

    let first = ledger.reserve_or_reject(&order, &skus(&["sku-3"])).await.unwrap();
    let second = ledger.reserve_or_reject(&order, &skus(&["sku-3"])).await.unwrap();

    assert_eq!(first, AttemptWrite::Recorded);
    assert_eq!(second, AttemptWrite::AlreadyRecorded(AttemptOutcome::Rejected));
    let staged = store.outbox_for_aggregate("o-2").await.unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].event_type, "InventoryReservationFailed");
}

#[tokio::test]
#[serial]
async fn release_and_sell_follow_the_owner() {
    let store = get_test_store(&["sku-1", "sku-2"]).await;
    let ledger = ReservationLedger::new(Arc::new(store));
    let first = OrderId::new("o-1");
    let second = OrderId::new("o-2");

    ledger.reserve_all(&first, &skus(&["sku-1"])).await.unwrap();
    assert_eq!(ledger.release_by_order(&first).await.unwrap(), 1);
    assert_eq!(ledger.release_by_order(&first).await.unwrap(), 0);

    ledger.reserve_all(&second, &skus(&["sku-1", "sku-2"])).await.unwrap();
    assert_eq!(ledger.mark_sold_by_order(&second).await.unwrap(), 2);
    assert_eq!(ledger.mark_sold_by_order(&second).await.unwrap(), 0);

    let item = ledger.item(&Sku::new("sku-1")).await.unwrap().unwrap();
    assert_eq!(item.status, StockStatus::Sold);
    assert!(item.is_owned_by(&second));
}

#[tokio::test]
#[serial]
async fn concurrent_overlapping_reservations_have_one_winner_per_sku() {
    let names: Vec<String> = (0..6).map(|i| format!("sku-{i}")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let store = get_test_store(&name_refs).await;
    let ledger = ReservationLedger::new(Arc::new(store));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            let order = OrderId::new(format!("order-{i}"));
            let wanted: Vec<Sku> = (0..2).map(|k| Sku::new(format!("sku-{}", (i + k) % 6))).collect();
            let result = ledger.reserve_all(&order, &wanted).await;
            (order, wanted, result)
        }));
    }

    let mut owners: HashMap<Sku, OrderId> = HashMap::new();
    for task in tasks {
        let (order, wanted, result) = task.await.unwrap();
        match result {
            Ok(_) => {
                for sku in wanted {
                    assert!(owners.insert(sku, order.clone()).is_none());
                }
            }
            Err(LedgerError::ReservationConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    for item in ledger.list().await.unwrap() {
        match owners.get(&item.sku) {
            Some(owner) => assert!(item.is_owned_by(owner)),
            None => assert!(item.is_available()),
        }
    }
}
