use common::OrderId;
use messaging::MessagingError;
use thiserror::Error;

use crate::payment::PaymentOutcome;

#[derive(Debug, Error)]
pub enum PaymentError {
    /// A different outcome was already recorded for the order.
    #[error("Payment for order {order_id} already recorded as {recorded}")]
    Conflict {
        order_id: OrderId,
        recorded: PaymentOutcome,
    },

    #[error("Corrupt payment row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
