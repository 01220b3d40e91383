//! Records payment outcomes and announces them to the saga.

use std::sync::Arc;

use chrono::Utc;
use common::OrderId;
use messaging::{EventEnvelope, OutboxMessage};

use crate::payment::{PaymentOutcome, PaymentRecord};
use crate::store::PaymentStore;
use crate::{PaymentError, Result};

/// Whether a call changed anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    New(PaymentRecord),
    /// The same outcome had already been recorded.
    Existing(PaymentRecord),
}

impl Recorded {
    pub fn record(&self) -> &PaymentRecord {
        match self {
            Recorded::New(record) | Recorded::Existing(record) => record,
        }
    }
}

/// Accepts one payment outcome per order and stages the matching event.
#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
}

impl PaymentService {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    pub async fn succeed(&self, order_id: &OrderId) -> Result<Recorded> {
        self.record(order_id, PaymentOutcome::Succeeded).await
    }

    pub async fn fail(&self, order_id: &OrderId) -> Result<Recorded> {
        self.record(order_id, PaymentOutcome::Failed).await
    }

    /// Records `outcome` for the order. Repeating the recorded outcome is a
    /// no-op; a different outcome fails with [`PaymentError::Conflict`].
    #[tracing::instrument(skip(self))]
    pub async fn record(&self, order_id: &OrderId, outcome: PaymentOutcome) -> Result<Recorded> {
        let record = PaymentRecord {
            order_id: order_id.clone(),
            outcome,
            recorded_at: Utc::now(),
        };
        let staged = OutboxMessage::from_envelope(&EventEnvelope::new(outcome.event(order_id.clone())))?;

        match self.store.record(&record, &staged).await? {
            None => {
                metrics::counter!("payments_recorded_total", "outcome" => outcome.as_str())
                    .increment(1);
                tracing::info!(%order_id, %outcome, "payment outcome recorded");
                Ok(Recorded::New(record))
            }
            Some(existing) if existing.outcome == outcome => {
                tracing::info!(%order_id, %outcome, "payment outcome already recorded");
                Ok(Recorded::Existing(existing))
            }
            Some(existing) => Err(PaymentError::Conflict {
                order_id: order_id.clone(),
                recorded: existing.outcome,
            }),
        }
    }

    pub async fn get(&self, order_id: &OrderId) -> Result<Option<PaymentRecord>> {
        self.store.get(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPaymentStore;
    use messaging::{OutboxStore, SagaEvent};

    fn service() -> (PaymentService, InMemoryPaymentStore) {
        let store = InMemoryPaymentStore::new();
        (PaymentService::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn success_stages_payment_succeeded() {
        let (service, store) = service();
        let order = OrderId::new("o-1");

        let recorded = service.succeed(&order).await.unwrap();

        assert!(matches!(recorded, Recorded::New(_)));
        let staged = store.outbox_for_aggregate("o-1").await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(
            EventEnvelope::decode(&staged[0].payload).unwrap().event,
            SagaEvent::payment_succeeded(order)
        );
    }

    #[tokio::test]
    async fn repeating_the_outcome_is_a_noop() {
        let (service, store) = service();
        let order = OrderId::new("o-1");

        service.fail(&order).await.unwrap();
        let again = service.fail(&order).await.unwrap();

        assert!(matches!(again, Recorded::Existing(r) if r.outcome == PaymentOutcome::Failed));
        assert_eq!(store.outbox_for_aggregate("o-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contradicting_outcome_is_rejected() {
        let (service, store) = service();
        let order = OrderId::new("o-1");

        service.succeed(&order).await.unwrap();
        let result = service.fail(&order).await;

        assert!(matches!(
            result,
            Err(PaymentError::Conflict {
                recorded: PaymentOutcome::Succeeded,
                ..
            })
        ));
        assert_eq!(store.outbox_for_aggregate("o-1").await.unwrap().len(), 1);
        assert_eq!(
            service.get(&order).await.unwrap().unwrap().outcome,
            PaymentOutcome::Succeeded
        );
    }
}
