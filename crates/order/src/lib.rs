//! Order service: the saga coordinator and everything it owns.
//!
//! - [`coordinator`]: creates orders and waits for their reservation outcome
//! - [`correlation`]: the one-shot registry bridging requests and events
//! - [`handler`]: applies inventory and payment outcomes to orders
//! - [`reconcile`]: reports orders the saga left hanging

pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod memory;
pub mod order;
pub mod postgres;
pub mod reconcile;
pub mod status;
pub mod store;

pub use coordinator::{
    DEFAULT_RESERVATION_TIMEOUT, OrderSagaCoordinator, ReservationOutcome, ReservationRegistry,
};
pub use correlation::{CorrelationError, CorrelationRegistry, Pending};
pub use error::{OrderError, Result};
pub use handler::OrderEventHandler;
pub use memory::InMemoryOrderStore;
pub use order::{Order, OrderItem};
pub use postgres::PostgresOrderStore;
pub use reconcile::{ReconcileConfig, ReconcileReport, Reconciler, ReportOnly, StaleOrderPolicy};
pub use status::OrderStatus;
pub use store::{OrderStore, Transition};
