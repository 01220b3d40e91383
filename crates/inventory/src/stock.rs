//! Stock items and their reservation state.

use std::str::FromStr;

use common::{OrderId, Sku};
use serde::{Deserialize, Serialize};

use crate::LedgerError;

/// Reservation state of one stock item.
///
/// ```text
/// Available ──► Reserved ──► Sold
///     ▲            │
///     └────────────┘ (release)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StockStatus {
    #[default]
    Available,
    Reserved,
    Sold,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Available => "Available",
            StockStatus::Reserved => "Reserved",
            StockStatus::Sold => "Sold",
        }
    }
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StockStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Available" => Ok(StockStatus::Available),
            "Reserved" => Ok(StockStatus::Reserved),
            "Sold" => Ok(StockStatus::Sold),
            other => Err(LedgerError::CorruptRow(format!("unknown stock status '{other}'"))),
        }
    }
}

/// One unit of stock, identified by its SKU.
///
/// `order_id` is set exactly when the item is `Reserved` or `Sold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub sku: Sku,
    pub status: StockStatus,
    pub order_id: Option<OrderId>,
}

impl StockItem {
    pub fn available(sku: Sku) -> Self {
        Self {
            sku,
            status: StockStatus::Available,
            order_id: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == StockStatus::Available
    }

    pub fn is_owned_by(&self, order_id: &OrderId) -> bool {
        self.order_id.as_ref() == Some(order_id)
    }

    pub(crate) fn reserve(&mut self, order_id: &OrderId) {
        self.status = StockStatus::Reserved;
        self.order_id = Some(order_id.clone());
    }

    pub(crate) fn release(&mut self) {
        self.status = StockStatus::Available;
        self.order_id = None;
    }

    pub(crate) fn sell(&mut self) {
        self.status = StockStatus::Sold;
    }
}

/// Recorded result of an order's reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Reserved,
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Reserved => "Reserved",
            AttemptOutcome::Rejected => "Rejected",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Reserved" => Ok(AttemptOutcome::Reserved),
            "Rejected" => Ok(AttemptOutcome::Rejected),
            other => Err(LedgerError::CorruptRow(format!("unknown attempt outcome '{other}'"))),
        }
    }
}
