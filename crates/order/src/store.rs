use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use messaging::OutboxMessage;

use crate::Result;
use crate::order::Order;
use crate::status::OrderStatus;

/// Result of a compare-and-set status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The order was in the expected status and now has the new one.
    Applied(Order),
    /// The order was in another status; nothing changed.
    Unchanged(Order),
}

/// Persistence for orders and the order outbox.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists a new order and stages `event` in the same transaction.
    async fn insert_with_event(&self, order: &Order, event: &OutboxMessage) -> Result<()>;

    async fn get(&self, id: &OrderId) -> Result<Option<Order>>;

    /// Moves the order from `from` to `to` if it is currently in `from`.
    ///
    /// Fails with [`NotFound`](crate::OrderError::NotFound) for unknown ids.
    async fn transition(
        &self,
        id: &OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition>;

    /// Orders in one of `statuses` whose last update is older than `before`,
    /// oldest first.
    async fn stale(&self, statuses: &[OrderStatus], before: DateTime<Utc>) -> Result<Vec<Order>>;
}
