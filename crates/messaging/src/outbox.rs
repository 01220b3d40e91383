//! Transactional outbox.
//!
//! A domain write and the [`OutboxMessage`] announcing it are committed
//! together. Rows are only ever mutated to set `published_at`, which the
//! relay does after the broker acknowledged the publish.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::events::EventEnvelope;
use crate::{MessagingError, Result};

/// Header holding the destination topic.
pub const TOPIC_HEADER: &str = "topic";
/// Header holding the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";
/// Header holding the envelope schema version.
pub const SCHEMA_VERSION_HEADER: &str = "schema-version";

/// A staged event waiting to be relayed to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Same value as the event id inside the payload.
    pub id: EventId,

    /// The type of aggregate (e.g., "order", "inventory").
    pub aggregate_type: String,

    /// The aggregate this event belongs to. Used as the partition key.
    pub aggregate_id: String,

    /// The type of the event (e.g., "OrderCreated").
    pub event_type: String,

    /// The encoded [`EventEnvelope`].
    pub payload: Vec<u8>,

    pub headers: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Builds the outbox row for an envelope, deriving aggregate and topic
    /// from the event variant.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        let event = &envelope.event;
        let headers = HashMap::from([
            (TOPIC_HEADER.to_string(), event.topic().to_string()),
            (CONTENT_TYPE_HEADER.to_string(), "application/json".to_string()),
            (
                SCHEMA_VERSION_HEADER.to_string(),
                envelope.schema_version.to_string(),
            ),
        ]);

        Ok(Self {
            id: envelope.event_id,
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.order_id().to_string(),
            event_type: event.event_type().to_string(),
            payload: envelope.encode()?,
            headers,
            created_at: envelope.occurred_at,
            published_at: None,
        })
    }

    /// Destination topic recorded when the row was staged.
    pub fn topic(&self) -> Result<&str> {
        self.headers
            .get(TOPIC_HEADER)
            .map(String::as_str)
            .ok_or(MessagingError::MissingHeader {
                id: self.id,
                header: TOPIC_HEADER,
            })
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Read/mark side of an outbox, as seen by the relay.
///
/// Staging is not part of this trait: it always happens inside the owning
/// store's write transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` unpublished rows in creation order.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Sets `published_at` on a row. Marking an already published row is a no-op.
    async fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> Result<()>;

    /// Returns every row staged for an aggregate, oldest first.
    async fn outbox_for_aggregate(&self, aggregate_id: &str) -> Result<Vec<OutboxMessage>>;
}

/// In-memory outbox table, embedded in the in-memory stores so that it
/// shares their lock with the domain tables.
#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    rows: Vec<OutboxMessage>,
}

impl OutboxTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row. Callers hold the same guard as the domain mutation.
    pub fn stage(&mut self, message: OutboxMessage) {
        self.rows.push(message);
    }

    pub fn unpublished(&self, limit: usize) -> Vec<OutboxMessage> {
        self.rows
            .iter()
            .filter(|m| m.published_at.is_none())
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn mark_published(&mut self, id: EventId, at: DateTime<Utc>) {
        if let Some(row) = self
            .rows
            .iter_mut()
            .find(|m| m.id == id && m.published_at.is_none())
        {
            row.published_at = Some(at);
        }
    }

    pub fn for_aggregate(&self, aggregate_id: &str) -> Vec<OutboxMessage> {
        self.rows
            .iter()
            .filter(|m| m.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
