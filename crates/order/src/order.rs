use chrono::{DateTime, Utc};
use common::{OrderId, Sku};
use serde::{Deserialize, Serialize};

use crate::status::OrderStatus;

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: Sku,
}

/// Order snapshot as stored and returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A new `Pending` order with a generated id.
    pub fn new(skus: Vec<Sku>) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::generate(),
            items: skus
                .into_iter()
                .map(|product_id| OrderItem { product_id })
                .collect(),
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn skus(&self) -> Vec<Sku> {
        self.items.iter().map(|i| i.product_id.clone()).collect()
    }
}
