//! Order service reactions to inventory and payment events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::OrderId;
use messaging::events::{PaymentFailed, PaymentSucceeded, ReservationFailed, ReservationSucceeded};
use messaging::{Disposition, EventContext, HandlerError, HandlerResult, SagaEventHandler};
use status_hub::StatusBroadcastHub;

use crate::OrderError;
use crate::coordinator::{ReservationOutcome, ReservationRegistry};
use crate::order::Order;
use crate::status::OrderStatus;
use crate::store::{OrderStore, Transition};

/// Applies saga outcomes to orders.
///
/// Reservation outcomes are persisted here, then handed to any request still
/// waiting in the registry. Every applied change is broadcast to live
/// status subscribers.
#[derive(Clone)]
pub struct OrderEventHandler {
    store: Arc<dyn OrderStore>,
    registry: ReservationRegistry,
    hub: StatusBroadcastHub,
}

impl OrderEventHandler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: ReservationRegistry,
        hub: StatusBroadcastHub,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
        }
    }

    async fn advance(
        &self,
        order_id: &OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Transition, HandlerError> {
        let transition = self
            .store
            .transition(order_id, from, to, Utc::now())
            .await
            .map_err(|e| match e {
                OrderError::NotFound(_) => HandlerError::Permanent(e.to_string()),
                e if e.is_transient() => HandlerError::Transient(e.to_string()),
                e => HandlerError::Permanent(e.to_string()),
            })?;

        if let Transition::Applied(order) = &transition {
            tracing::info!(%order_id, %from, %to, "order status changed");
            // The other topic's worker may already have broadcast a later status.
            let status = order.status;
            let broadcast = self.hub.broadcast_if(order_id, status.as_str(), |cached| {
                cached
                    .and_then(|s| s.parse::<OrderStatus>().ok())
                    .is_none_or(|prev| prev.can_transition_to(status))
            });
            if broadcast.is_none() {
                tracing::debug!(%order_id, %status, "skipped stale status broadcast");
            }
        }
        Ok(transition)
    }

    async fn on_reservation_outcome(
        &self,
        order_id: &OrderId,
        to: OrderStatus,
        outcome: impl FnOnce(Order) -> ReservationOutcome,
    ) -> HandlerResult {
        match self.advance(order_id, OrderStatus::Pending, to).await? {
            Transition::Applied(order) => {
                if !self.registry.resolve(order_id, outcome(order)) {
                    tracing::info!(%order_id, %to, "reservation outcome applied after the request stopped waiting");
                }
                Ok(Disposition::Applied)
            }
            Transition::Unchanged(current) => {
                if current.status != to {
                    tracing::warn!(
                        %order_id,
                        current = %current.status,
                        outcome = %to,
                        "reservation outcome does not match order status"
                    );
                }
                Ok(Disposition::Duplicate)
            }
        }
    }

    async fn on_payment_outcome(&self, order_id: &OrderId, to: OrderStatus) -> HandlerResult {
        match self
            .advance(order_id, OrderStatus::AwaitingPayment, to)
            .await?
        {
            Transition::Applied(_) => Ok(Disposition::Applied),
            Transition::Unchanged(current) if current.status == to => Ok(Disposition::Duplicate),
            // Reservation and payment travel on different topics.
            Transition::Unchanged(current) if current.status == OrderStatus::Pending => Err(
                HandlerError::Transient(format!("order {order_id} has no reservation outcome yet")),
            ),
            Transition::Unchanged(current) => Err(HandlerError::Permanent(format!(
                "payment outcome {to} for order {order_id} in status {}",
                current.status
            ))),
        }
    }
}

#[async_trait]
impl SagaEventHandler for OrderEventHandler {
    async fn on_reservation_succeeded(
        &self,
        _ctx: EventContext,
        event: &ReservationSucceeded,
    ) -> HandlerResult {
        self.on_reservation_outcome(
            &event.order_id,
            OrderStatus::AwaitingPayment,
            ReservationOutcome::Reserved,
        )
        .await
    }

    async fn on_reservation_failed(
        &self,
        _ctx: EventContext,
        event: &ReservationFailed,
    ) -> HandlerResult {
        let unavailable = event.unavailable.clone();
        self.on_reservation_outcome(&event.order_id, OrderStatus::Failed, move |order| {
            ReservationOutcome::Rejected { order, unavailable }
        })
        .await
    }

    async fn on_payment_succeeded(
        &self,
        _ctx: EventContext,
        event: &PaymentSucceeded,
    ) -> HandlerResult {
        self.on_payment_outcome(&event.order_id, OrderStatus::Paid).await
    }

    async fn on_payment_failed(&self, _ctx: EventContext, event: &PaymentFailed) -> HandlerResult {
        self.on_payment_outcome(&event.order_id, OrderStatus::Failed).await
    }
}
