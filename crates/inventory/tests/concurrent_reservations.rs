//! Many orders racing for overlapping SKUs: each SKU ends up with one owner.

use std::collections::HashMap;
use std::sync::Arc;

use common::{OrderId, Sku};
use inventory::{InMemoryStockStore, LedgerError, ReservationLedger, StockStatus};

fn sku_set(i: usize) -> Vec<Sku> {
    // Overlapping windows: order i wants sku-i, sku-(i+1), sku-(i+2) modulo 8.
    (0..3).map(|k| Sku::new(format!("sku-{}", (i + k) % 8))).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn overlapping_orders_never_double_reserve() {
    let all: Vec<Sku> = (0..8).map(|i| Sku::new(format!("sku-{i}"))).collect();
    let store = InMemoryStockStore::with_available(&all).await;
    let ledger = ReservationLedger::new(Arc::new(store));

    let mut tasks = Vec::new();
    for i in 0..32 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            let order = OrderId::new(format!("order-{i}"));
            let skus = sku_set(i);
            let result = ledger.reserve_all(&order, &skus).await;
            (order, skus, result)
        }));
    }

    let mut owners: HashMap<Sku, OrderId> = HashMap::new();
    for task in tasks {
        let (order, skus, result) = task.await.unwrap();
        match result {
            Ok(_) => {
                for sku in skus {
                    let previous = owners.insert(sku.clone(), order.clone());
                    assert!(previous.is_none(), "{sku} reserved by {previous:?} and {order}");
                }
            }
            Err(LedgerError::ReservationConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert!(!owners.is_empty());
    for item in ledger.list().await.unwrap() {
        match owners.get(&item.sku) {
            Some(owner) => {
                assert_eq!(item.status, StockStatus::Reserved);
                assert!(item.is_owned_by(owner));
            }
            None => assert!(item.is_available()),
        }
    }
}
