use common::{OrderId, Sku};
use messaging::MessagingError;
use thiserror::Error;

/// Errors raised by the reservation ledger and its stores.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// At least one requested SKU was not available. Nothing was reserved.
    #[error("Reservation conflict for order {order_id}: unavailable {unavailable:?}")]
    ReservationConflict {
        order_id: OrderId,
        unavailable: Vec<Sku>,
    },

    /// The request itself is unusable (no SKUs, blank SKU).
    #[error("Invalid reservation request: {0}")]
    InvalidRequest(String),

    /// A stored row holds a value this version does not understand.
    #[error("Corrupt stock row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl LedgerError {
    /// True for failures worth retrying (storage hiccups). Conflicts and bad
    /// requests will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Database(_)
                | LedgerError::Messaging(
                    MessagingError::Database(_) | MessagingError::Unavailable(_)
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
