use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId, Sku};
use messaging::{OutboxMessage, OutboxStore, OutboxTable};
use tokio::sync::Mutex;

use crate::stock::{AttemptOutcome, StockItem, StockStatus};
use crate::store::{AttemptWrite, StockStore};
use crate::{LedgerError, Result};

#[derive(Default)]
struct State {
    items: BTreeMap<Sku, StockItem>,
    attempts: HashMap<OrderId, AttemptOutcome>,
    outbox: OutboxTable,
}

/// In-memory stock store for tests and database-less runs.
///
/// Stock rows, attempts and the outbox share one lock, which gives every
/// operation the all-or-nothing behaviour of a database transaction.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with every SKU `Available`.
    pub async fn with_available(skus: &[Sku]) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().await;
            for sku in skus {
                state.items.insert(sku.clone(), StockItem::available(sku.clone()));
            }
        }
        store
    }

    /// Number of outbox rows, published or not.
    pub async fn outbox_len(&self) -> usize {
        self.state.lock().await.outbox.len()
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn add_available(&self, skus: &[Sku]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for sku in skus {
            if !state.items.contains_key(sku) {
                state.items.insert(sku.clone(), StockItem::available(sku.clone()));
                added += 1;
            }
        }
        Ok(added)
    }

    async fn get(&self, sku: &Sku) -> Result<Option<StockItem>> {
        Ok(self.state.lock().await.items.get(sku).cloned())
    }

    async fn list(&self) -> Result<Vec<StockItem>> {
        Ok(self.state.lock().await.items.values().cloned().collect())
    }

    async fn attempt_for(&self, order_id: &OrderId) -> Result<Option<AttemptOutcome>> {
        Ok(self.state.lock().await.attempts.get(order_id).copied())
    }

    async fn reserve_all(
        &self,
        order_id: &OrderId,
        skus: &[Sku],
        outcome: &OutboxMessage,
    ) -> Result<AttemptWrite> {
        let mut state = self.state.lock().await;

        if let Some(previous) = state.attempts.get(order_id) {
            return Ok(AttemptWrite::AlreadyRecorded(*previous));
        }

        let unavailable: Vec<Sku> = skus
            .iter()
            .filter(|sku| !state.items.get(*sku).is_some_and(StockItem::is_available))
            .cloned()
            .collect();
        if !unavailable.is_empty() {
            return Err(LedgerError::ReservationConflict {
                order_id: order_id.clone(),
                unavailable,
            });
        }

        for sku in skus {
            if let Some(item) = state.items.get_mut(sku) {
                item.reserve(order_id);
            }
        }
        state.attempts.insert(order_id.clone(), AttemptOutcome::Reserved);
        state.outbox.stage(outcome.clone());
        Ok(AttemptWrite::Recorded)
    }

    async fn record_rejection(
        &self,
        order_id: &OrderId,
        outcome: &OutboxMessage,
    ) -> Result<AttemptWrite> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.attempts.get(order_id) {
            return Ok(AttemptWrite::AlreadyRecorded(*previous));
        }
        state.attempts.insert(order_id.clone(), AttemptOutcome::Rejected);
        state.outbox.stage(outcome.clone());
        Ok(AttemptWrite::Recorded)
    }

    async fn release_by_order(&self, order_id: &OrderId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for item in state.items.values_mut() {
            if item.status == StockStatus::Reserved && item.is_owned_by(order_id) {
                item.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn mark_sold_by_order(&self, order_id: &OrderId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut sold = 0;
        for item in state.items.values_mut() {
            if item.status == StockStatus::Reserved && item.is_owned_by(order_id) {
                item.sell();
                sold += 1;
            }
        }
        Ok(sold)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStockStore {
    async fn fetch_unpublished(&self, limit: usize) -> messaging::Result<Vec<OutboxMessage>> {
        Ok(self.state.lock().await.outbox.unpublished(limit))
    }

    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> messaging::Result<()> {
        self.state.lock().await.outbox.mark_published(id, at);
        Ok(())
    }

    async fn outbox_for_aggregate(&self, aggregate_id: &str) -> messaging::Result<Vec<OutboxMessage>> {
        Ok(self.state.lock().await.outbox.for_aggregate(aggregate_id))
    }
}
