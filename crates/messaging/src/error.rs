use thiserror::Error;

use common::EventId;

/// Errors raised by the broker abstraction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The broker did not acknowledge the publish.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The bus was shut down.
    #[error("Event bus closed")]
    Closed,
}

/// Errors that can occur when staging, relaying or routing events.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected or never acknowledged a message.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// An outbox row is missing a header the relay needs.
    #[error("Outbox message {id} is missing header '{header}'")]
    MissingHeader { id: EventId, header: &'static str },

    /// An in-memory store lock was poisoned or otherwise unusable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
