//! Order service error types.

use std::time::Duration;

use common::{OrderId, Sku};
use messaging::MessagingError;
use thiserror::Error;

use crate::correlation::CorrelationError;
use crate::status::OrderStatus;

/// Errors that can occur while creating or advancing orders.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The request is malformed (no items, blank or repeated SKU).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Inventory could not reserve every requested SKU. The order is `Failed`.
    #[error("Reservation conflict for order {order_id}")]
    ReservationConflict {
        order_id: OrderId,
        unavailable: Vec<Sku>,
    },

    /// No reservation outcome arrived in time. The order stays `Pending`.
    #[error("No reservation outcome for order {order_id} within {waited:?}")]
    CorrelationTimeout { order_id: OrderId, waited: Duration },

    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// The order is not in a status the requested change can start from.
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("Corrupt order row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl OrderError {
    /// True for storage failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrderError::Database(_)
                | OrderError::Messaging(MessagingError::Database(_) | MessagingError::Unavailable(_))
        )
    }
}

/// Convenience type alias for order results.
pub type Result<T> = std::result::Result<T, OrderError>;
