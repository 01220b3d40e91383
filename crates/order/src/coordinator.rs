//! Order saga coordinator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{OrderId, Sku};
use messaging::{EventEnvelope, OutboxMessage, SagaEvent};

use crate::correlation::{CorrelationError, CorrelationRegistry};
use crate::order::Order;
use crate::store::OrderStore;
use crate::{OrderError, Result};

/// Reservation result handed from the event handler to the waiting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// Stock is reserved; carries the order as of `AwaitingPayment`.
    Reserved(Order),
    /// Stock was unavailable; carries the order as of `Failed`.
    Rejected { order: Order, unavailable: Vec<Sku> },
}

/// Registry of requests waiting for a reservation outcome.
pub type ReservationRegistry = CorrelationRegistry<OrderId, ReservationOutcome>;

/// Default bound on how long `create_order` waits for inventory.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives an order from creation to its reservation outcome.
///
/// The order row and its `OrderCreated` event are committed together. The
/// caller then waits, bounded, for the inventory outcome that the order's
/// event handler applies and resolves through the shared registry.
#[derive(Clone)]
pub struct OrderSagaCoordinator {
    store: Arc<dyn OrderStore>,
    registry: ReservationRegistry,
    reservation_timeout: Duration,
}

impl OrderSagaCoordinator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: ReservationRegistry,
        reservation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            reservation_timeout,
        }
    }

    pub fn registry(&self) -> &ReservationRegistry {
        &self.registry
    }

    pub fn reservation_timeout(&self) -> Duration {
        self.reservation_timeout
    }

    /// Creates an order and waits for its stock reservation, using the
    /// configured timeout.
    pub async fn create_order(&self, items: Vec<Sku>) -> Result<Order> {
        self.create_order_within(items, self.reservation_timeout).await
    }

    /// Creates an order and waits at most `timeout` for its stock reservation.
    ///
    /// Returns the order in `AwaitingPayment` once stock is reserved,
    /// [`OrderError::ReservationConflict`] when it could not be, and
    /// [`OrderError::CorrelationTimeout`] when no outcome arrived in time (the
    /// order then stays `Pending`). Dropping the returned future stops the
    /// wait and unregisters it.
    #[tracing::instrument(
        skip(self, items),
        fields(item_count = items.len(), order_id = tracing::field::Empty)
    )]
    pub async fn create_order_within(&self, items: Vec<Sku>, timeout: Duration) -> Result<Order> {
        validate(&items)?;
        let started = Instant::now();

        let order = Order::new(items);
        let order_id = order.id.clone();
        tracing::Span::current().record("order_id", tracing::field::display(&order_id));

        let event = SagaEvent::order_created(order_id.clone(), order.skus());
        let staged = OutboxMessage::from_envelope(&EventEnvelope::new(event))?;

        // Registered before the commit: the outcome cannot be produced before
        // the OrderCreated row is visible to the relay.
        let pending = self.registry.push(order_id.clone())?;
        self.store.insert_with_event(&order, &staged).await?;
        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(%order_id, "order created, waiting for reservation");

        let result = match pending.wait(timeout).await {
            Ok(ReservationOutcome::Reserved(order)) => Ok(order),
            Ok(ReservationOutcome::Rejected { unavailable, .. }) => {
                Err(OrderError::ReservationConflict {
                    order_id: order_id.clone(),
                    unavailable,
                })
            }
            Err(CorrelationError::Timeout { .. } | CorrelationError::Abandoned(_)) => {
                metrics::counter!("correlation_timeouts_total").increment(1);
                tracing::warn!(%order_id, ?timeout, "no reservation outcome in time, order left Pending");
                Err(OrderError::CorrelationTimeout {
                    order_id: order_id.clone(),
                    waited: timeout,
                })
            }
            Err(e) => Err(e.into()),
        };

        let outcome = match &result {
            Ok(_) => "reserved",
            Err(OrderError::ReservationConflict { .. }) => "conflict",
            Err(OrderError::CorrelationTimeout { .. }) => "timeout",
            Err(_) => "error",
        };
        metrics::counter!("order_saga_outcomes_total", "outcome" => outcome).increment(1);
        metrics::histogram!("order_saga_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    pub async fn get_order(&self, id: &OrderId) -> Result<Order> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrderError::NotFound(id.clone()))
    }
}

fn validate(items: &[Sku]) -> Result<()> {
    if items.is_empty() {
        return Err(OrderError::Validation("order must contain at least one item".into()));
    }
    let mut seen = HashSet::new();
    for sku in items {
        if sku.is_blank() {
            return Err(OrderError::Validation("product_id must not be blank".into()));
        }
        if !seen.insert(sku) {
            return Err(OrderError::Validation(format!("product {sku} appears more than once")));
        }
    }
    Ok(())
}
