//! All-or-nothing stock reservation.

use std::sync::Arc;

use common::{OrderId, Sku};
use messaging::{EventEnvelope, OutboxMessage, SagaEvent};

use crate::stock::{AttemptOutcome, StockItem};
use crate::store::{AttemptWrite, StockStore};
use crate::{LedgerError, Result};

/// Reserves, releases and finalizes stock on behalf of orders.
///
/// Each reservation attempt is recorded once per order together with the
/// outcome event, which is how redelivered requests are recognised.
#[derive(Clone)]
pub struct ReservationLedger {
    store: Arc<dyn StockStore>,
}

impl ReservationLedger {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    /// Reserves every SKU for `order_id` or none of them.
    ///
    /// On success `InventoryReservationSucceeded` is staged in the same write.
    /// When any SKU is missing or not `Available` no row is touched and
    /// [`LedgerError::ReservationConflict`] lists the offending SKUs.
    #[tracing::instrument(skip(self, skus), fields(items = skus.len()))]
    pub async fn reserve_all(&self, order_id: &OrderId, skus: &[Sku]) -> Result<AttemptWrite> {
        let skus = normalize(skus)?;
        let outcome = staged(SagaEvent::reservation_succeeded(order_id.clone()))?;

        match self.store.reserve_all(order_id, &skus, &outcome).await {
            Ok(AttemptWrite::Recorded) => {
                metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                    .increment(1);
                tracing::info!(%order_id, "stock reserved");
                Ok(AttemptWrite::Recorded)
            }
            Ok(previous @ AttemptWrite::AlreadyRecorded(_)) => {
                tracing::info!(%order_id, ?previous, "reservation already attempted");
                Ok(previous)
            }
            Err(e @ LedgerError::ReservationConflict { .. }) => {
                metrics::counter!("inventory_reservations_total", "outcome" => "conflict")
                    .increment(1);
                tracing::info!(%order_id, error = %e, "reservation conflict");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Records that the order's reservation was rejected and stages
    /// `InventoryReservationFailed`.
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self, order_id: &OrderId, unavailable: Vec<Sku>) -> Result<AttemptWrite> {
        let outcome = staged(SagaEvent::reservation_failed(order_id.clone(), unavailable))?;
        self.store.record_rejection(order_id, &outcome).await
    }

    /// Reserves, or records the rejection when stock is not available.
    ///
    /// This is the inventory side of `OrderCreated`: exactly one outcome event
    /// is staged per order, however often it is called.
    pub async fn reserve_or_reject(&self, order_id: &OrderId, skus: &[Sku]) -> Result<AttemptWrite> {
        if let Some(previous) = self.store.attempt_for(order_id).await? {
            return Ok(AttemptWrite::AlreadyRecorded(previous));
        }

        match self.reserve_all(order_id, skus).await {
            Err(LedgerError::ReservationConflict { unavailable, .. }) => {
                self.reject(order_id, unavailable).await
            }
            Err(LedgerError::InvalidRequest(reason)) => {
                tracing::warn!(%order_id, %reason, "rejecting unusable reservation request");
                self.reject(order_id, Vec::new()).await
            }
            other => other,
        }
    }

    /// Returns the order's reserved items to `Available`. Items that are not
    /// reserved by this order are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn release_by_order(&self, order_id: &OrderId) -> Result<usize> {
        let released = self.store.release_by_order(order_id).await?;
        if released > 0 {
            tracing::info!(%order_id, released, "stock released");
        }
        Ok(released)
    }

    /// Finalizes the order's reserved items as `Sold`.
    #[tracing::instrument(skip(self))]
    pub async fn mark_sold_by_order(&self, order_id: &OrderId) -> Result<usize> {
        let sold = self.store.mark_sold_by_order(order_id).await?;
        if sold > 0 {
            tracing::info!(%order_id, sold, "stock sold");
        }
        Ok(sold)
    }

    /// Adds SKUs as `Available`; SKUs that already exist keep their state.
    pub async fn seed(&self, skus: &[Sku]) -> Result<usize> {
        self.store.add_available(skus).await
    }

    pub async fn item(&self, sku: &Sku) -> Result<Option<StockItem>> {
        self.store.get(sku).await
    }

    pub async fn list(&self) -> Result<Vec<StockItem>> {
        self.store.list().await
    }

    pub async fn attempt_for(&self, order_id: &OrderId) -> Result<Option<AttemptOutcome>> {
        self.store.attempt_for(order_id).await
    }
}

fn staged(event: SagaEvent) -> Result<OutboxMessage> {
    Ok(OutboxMessage::from_envelope(&EventEnvelope::new(event))?)
}

fn normalize(skus: &[Sku]) -> Result<Vec<Sku>> {
    if skus.is_empty() {
        return Err(LedgerError::InvalidRequest("no SKUs requested".into()));
    }
    if skus.iter().any(Sku::is_blank) {
        return Err(LedgerError::InvalidRequest("blank SKU".into()));
    }
    let mut skus = skus.to_vec();
    skus.sort();
    skus.dedup();
    Ok(skus)
}
