use async_trait::async_trait;
use common::{OrderId, Sku};
use messaging::OutboxMessage;

use crate::Result;
use crate::stock::{AttemptOutcome, StockItem};

/// What a store did with a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptWrite {
    /// The attempt was recorded together with its outcome event.
    Recorded,
    /// An attempt for this order already exists; nothing was written.
    AlreadyRecorded(AttemptOutcome),
}

/// Persistence for stock rows, reservation attempts and the inventory outbox.
///
/// Every method that stages an outbox row does so in the same transaction as
/// the stock change it announces.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Inserts missing SKUs as `Available`. Existing rows are left untouched.
    async fn add_available(&self, skus: &[Sku]) -> Result<usize>;

    async fn get(&self, sku: &Sku) -> Result<Option<StockItem>>;

    /// Every stock item ordered by SKU.
    async fn list(&self) -> Result<Vec<StockItem>>;

    async fn attempt_for(&self, order_id: &OrderId) -> Result<Option<AttemptOutcome>>;

    /// Claims every SKU for `order_id`, records a `Reserved` attempt and
    /// stages `outcome`, or does nothing at all.
    ///
    /// Fails with [`ReservationConflict`](crate::LedgerError::ReservationConflict)
    /// listing the unavailable SKUs when any of them is not `Available`.
    async fn reserve_all(
        &self,
        order_id: &OrderId,
        skus: &[Sku],
        outcome: &OutboxMessage,
    ) -> Result<AttemptWrite>;

    /// Records a `Rejected` attempt and stages `outcome`.
    async fn record_rejection(&self, order_id: &OrderId, outcome: &OutboxMessage)
    -> Result<AttemptWrite>;

    /// `Reserved` → `Available` for every row owned by the order. Returns the
    /// number of rows changed.
    async fn release_by_order(&self, order_id: &OrderId) -> Result<usize>;

    /// `Reserved` → `Sold` for every row owned by the order. Returns the
    /// number of rows changed.
    async fn mark_sold_by_order(&self, order_id: &OrderId) -> Result<usize>;
}
