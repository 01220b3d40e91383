use async_trait::async_trait;
use common::OrderId;
use messaging::OutboxMessage;

use crate::Result;
use crate::payment::PaymentRecord;

/// Persistence for payment records and the payment outcome outbox.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts `record` and stages `event` in one transaction.
    ///
    /// When a record for the order already exists nothing is written and the
    /// existing record is returned instead.
    async fn record(&self, record: &PaymentRecord, event: &OutboxMessage)
    -> Result<Option<PaymentRecord>>;

    async fn get(&self, order_id: &OrderId) -> Result<Option<PaymentRecord>>;
}
