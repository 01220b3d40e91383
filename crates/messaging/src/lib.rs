//! Event plumbing shared by the order, inventory and payment services.
//!
//! - [`events`]: the closed, versioned set of saga events
//! - [`outbox`]: staging events next to the state change they announce
//! - [`relay`]: publishing staged events in per-aggregate order
//! - [`bus`]: the partitioned publish/subscribe seam and an in-memory broker
//! - [`router`]: typed, idempotent dispatch of inbound messages

pub mod bus;
pub mod error;
pub mod events;
pub mod outbox;
pub mod postgres;
pub mod relay;
pub mod retry;
pub mod router;

pub use bus::{BrokerMessage, EventBus, InMemoryEventBus, OutgoingMessage, PartitionStream};
pub use error::{BusError, MessagingError, Result};
pub use events::{EventEnvelope, SagaEvent};
pub use outbox::{OutboxMessage, OutboxStore, OutboxTable};
pub use postgres::PgOutbox;
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
pub use retry::RetryPolicy;
pub use router::{
    DEFAULT_DEAD_LETTER_CAPACITY, DeadLetter, Disposition, EventContext, EventRouter,
    HandlerError, HandlerResult, RouteOutcome, SagaEventHandler,
};
