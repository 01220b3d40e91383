//! Identifiers shared by the order, inventory and payment services.

mod types;

pub use types::{EventId, OrderId, Sku};
