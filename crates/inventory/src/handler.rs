//! Inventory's reactions to saga events.

use async_trait::async_trait;
use common::OrderId;
use messaging::events::{OrderCreated, PaymentFailed, PaymentSucceeded};
use messaging::{Disposition, EventContext, HandlerError, HandlerResult, SagaEventHandler};

use crate::LedgerError;
use crate::ledger::ReservationLedger;
use crate::store::AttemptWrite;

/// Routes `OrderCreated` to a reservation and payment outcomes to sale or release.
#[derive(Clone)]
pub struct InventoryEventHandler {
    ledger: ReservationLedger,
}

impl InventoryEventHandler {
    pub fn new(ledger: ReservationLedger) -> Self {
        Self { ledger }
    }

    /// Payment outcomes and `OrderCreated` travel on different topics, so a
    /// payment can arrive before this order was ever reserved.
    async fn ensure_attempted(&self, order_id: &OrderId) -> Result<(), HandlerError> {
        match self.ledger.attempt_for(order_id).await.map_err(handler_error)? {
            Some(_) => Ok(()),
            None => Err(HandlerError::Transient(format!(
                "order {order_id} has no reservation attempt yet"
            ))),
        }
    }
}

fn handler_error(e: LedgerError) -> HandlerError {
    if e.is_transient() {
        HandlerError::Transient(e.to_string())
    } else {
        HandlerError::Permanent(e.to_string())
    }
}

fn changed(rows: usize) -> Disposition {
    if rows > 0 {
        Disposition::Applied
    } else {
        Disposition::Duplicate
    }
}

#[async_trait]
impl SagaEventHandler for InventoryEventHandler {
    async fn on_order_created(&self, _ctx: EventContext, event: &OrderCreated) -> HandlerResult {
        match self
            .ledger
            .reserve_or_reject(&event.order_id, &event.items)
            .await
            .map_err(handler_error)?
        {
            AttemptWrite::Recorded => Ok(Disposition::Applied),
            AttemptWrite::AlreadyRecorded(_) => Ok(Disposition::Duplicate),
        }
    }

    async fn on_payment_succeeded(
        &self,
        _ctx: EventContext,
        event: &PaymentSucceeded,
    ) -> HandlerResult {
        self.ensure_attempted(&event.order_id).await?;
        self.ledger
            .mark_sold_by_order(&event.order_id)
            .await
            .map(changed)
            .map_err(handler_error)
    }

    async fn on_payment_failed(&self, _ctx: EventContext, event: &PaymentFailed) -> HandlerResult {
        self.ensure_attempted(&event.order_id).await?;
        self.ledger
            .release_by_order(&event.order_id)
            .await
            .map(changed)
            .map_err(handler_error)
    }
}
