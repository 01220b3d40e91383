use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::OrderId;
use messaging::SagaEvent;
use serde::{Deserialize, Serialize};

use crate::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Succeeded => "Succeeded",
            PaymentOutcome::Failed => "Failed",
        }
    }

    /// The saga event announcing this outcome.
    pub fn event(&self, order_id: OrderId) -> SagaEvent {
        match self {
            PaymentOutcome::Succeeded => SagaEvent::payment_succeeded(order_id),
            PaymentOutcome::Failed => SagaEvent::payment_failed(order_id),
        }
    }
}

impl std::fmt::Display for PaymentOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentOutcome {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Succeeded" => Ok(PaymentOutcome::Succeeded),
            "Failed" => Ok(PaymentOutcome::Failed),
            other => Err(PaymentError::CorruptRow(format!("unknown payment outcome '{other}'"))),
        }
    }
}

/// The single payment outcome recorded for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub order_id: OrderId,
    pub outcome: PaymentOutcome,
    pub recorded_at: DateTime<Utc>,
}
