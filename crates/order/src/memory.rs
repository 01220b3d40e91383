use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use messaging::{OutboxMessage, OutboxStore, OutboxTable};
use tokio::sync::RwLock;

use crate::order::Order;
use crate::status::OrderStatus;
use crate::store::{OrderStore, Transition};
use crate::{OrderError, Result};

#[derive(Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    outbox: OutboxTable,
}

/// In-memory order store for testing.
///
/// Orders and the outbox live under one lock, so an insert and its staged
/// event become visible together.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_with_event(&self, order: &Order, event: &OutboxMessage) -> Result<()> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.id) {
            return Err(OrderError::Validation(format!(
                "order {} already exists",
                order.id
            )));
        }
        state.orders.insert(order.id.clone(), order.clone());
        state.outbox.stage(event.clone());
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(id)
            .ok_or_else(|| OrderError::NotFound(id.clone()))?;

        if order.status != from {
            return Ok(Transition::Unchanged(order.clone()));
        }
        order.status = to;
        order.updated_at = at;
        Ok(Transition::Applied(order.clone()))
    }

    async fn stale(&self, statuses: &[OrderStatus], before: DateTime<Utc>) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        let mut stale: Vec<Order> = state
            .orders
            .values()
            .filter(|o| statuses.contains(&o.status) && o.updated_at < before)
            .cloned()
            .collect();
        stale.sort_by_key(|o| o.updated_at);
        Ok(stale)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOrderStore {
    async fn fetch_unpublished(&self, limit: usize) -> messaging::Result<Vec<OutboxMessage>> {
        Ok(self.state.read().await.outbox.unpublished(limit))
    }

    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> messaging::Result<()> {
        self.state.write().await.outbox.mark_published(id, at);
        Ok(())
    }

    async fn outbox_for_aggregate(&self, aggregate_id: &str) -> messaging::Result<Vec<OutboxMessage>> {
        Ok(self.state.read().await.outbox.for_aggregate(aggregate_id))
    }
}
