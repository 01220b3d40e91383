use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use messaging::{OutboxMessage, OutboxStore, OutboxTable};
use tokio::sync::Mutex;

use crate::Result;
use crate::payment::PaymentRecord;
use crate::store::PaymentStore;

#[derive(Default)]
struct State {
    payments: HashMap<OrderId, PaymentRecord>,
    outbox: OutboxTable,
}

/// In-memory payment store for testing.
#[derive(Clone, Default)]
pub struct InMemoryPaymentStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn record(
        &self,
        record: &PaymentRecord,
        event: &OutboxMessage,
    ) -> Result<Option<PaymentRecord>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.payments.get(&record.order_id) {
            return Ok(Some(existing.clone()));
        }
        state.payments.insert(record.order_id.clone(), record.clone());
        state.outbox.stage(event.clone());
        Ok(None)
    }

    async fn get(&self, order_id: &OrderId) -> Result<Option<PaymentRecord>> {
        Ok(self.state.lock().await.payments.get(order_id).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryPaymentStore {
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
