//! Order status machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::OrderError;

/// The status of an order in the fulfillment saga.
///
/// State transitions:
/// ```text
/// Pending ──► AwaitingPayment ──► Paid
///    │               │
///    └───────────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Created, stock reservation outcome not yet known.
    #[default]
    Pending,

    /// Stock is reserved; waiting for the payment outcome.
    AwaitingPayment,

    /// Payment succeeded (terminal state).
    Paid,

    /// Reservation or payment failed (terminal state).
    Failed,
}

impl OrderStatus {
    /// Returns true if the saga may move from `self` to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::AwaitingPayment)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::AwaitingPayment, OrderStatus::Paid)
                | (OrderStatus::AwaitingPayment, OrderStatus::Failed)
        )
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::AwaitingPayment => "AwaitingPayment",
            OrderStatus::Paid => "Paid",
            OrderStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OrderStatus::Pending),
            "AwaitingPayment" => Ok(OrderStatus::AwaitingPayment),
            "Paid" => Ok(OrderStatus::Paid),
            "Failed" => Ok(OrderStatus::Failed),
            other => Err(OrderError::CorruptRow(format!("unknown order status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::AwaitingPayment,
        OrderStatus::Paid,
        OrderStatus::Failed,
    ];

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_pending_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::AwaitingPayment));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn test_awaiting_payment_transitions() {
        assert!(OrderStatus::AwaitingPayment.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::AwaitingPayment.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::AwaitingPayment.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in [OrderStatus::Paid, OrderStatus::Failed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to));
            }
        }
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::AwaitingPayment.is_terminal());
    }

    #[test]
    fn test_status_parses_and_serializes_by_name() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
        assert!("Shipped".parse::<OrderStatus>().is_err());
    }
}
