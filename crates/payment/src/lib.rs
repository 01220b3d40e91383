//! Payment service: one recorded outcome per order, announced through the
//! payment outbox as `PaymentSucceeded` or `PaymentFailed`.

pub mod error;
pub mod memory;
pub mod payment;
pub mod postgres;
pub mod service;
pub mod store;

pub use error::{PaymentError, Result};
pub use memory::InMemoryPaymentStore;
pub use payment::{PaymentOutcome, PaymentRecord};
pub use postgres::PostgresPaymentStore;
pub use service::{PaymentService, Recorded};
pub use store::PaymentStore;
