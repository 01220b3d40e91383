//! Inventory service: stock rows, the reservation ledger and its saga handler.
//!
//! Stock is reserved all-or-nothing per order. Every reservation attempt is
//! announced through the inventory outbox in the same write that changed the
//! stock, so the order service learns each outcome exactly once per attempt
//! (modulo at-least-once redelivery).

pub mod error;
pub mod handler;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod stock;
pub mod store;

pub use error::{LedgerError, Result};
pub use handler::InventoryEventHandler;
pub use ledger::ReservationLedger;
pub use memory::InMemoryStockStore;
pub use postgres::PostgresStockStore;
pub use stock::{AttemptOutcome, StockItem, StockStatus};
pub use store::{AttemptWrite, StockStore};
