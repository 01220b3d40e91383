//! The closed set of saga events exchanged between services.
//!
//! Every message on the bus carries an [`EventEnvelope`] with exactly one
//! populated [`SagaEvent`] variant. Consumers switch on the variant, never on
//! the topic the message arrived on.

use chrono::{DateTime, Utc};
use common::{EventId, OrderId, Sku};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic carrying events owned by the order service.
pub const ORDER_EVENTS: &str = "order-events";
/// Topic carrying events owned by the inventory service.
pub const INVENTORY_EVENTS: &str = "inventory-events";
/// Topic carrying events owned by the payment service.
pub const PAYMENT_EVENTS: &str = "payment-events";

/// Current envelope schema version.
pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub items: Vec<Sku>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSucceeded {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFailed {
    pub order_id: OrderId,
    /// SKUs that were not available when the reservation was attempted.
    #[serde(default)]
    pub unavailable: Vec<Sku>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_id: OrderId,
}

/// All events that take part in the order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    OrderCreated(OrderCreated),
    InventoryReservationSucceeded(ReservationSucceeded),
    InventoryReservationFailed(ReservationFailed),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
}

impl SagaEvent {
    const VARIANTS: [&'static str; 5] = [
        "OrderCreated",
        "InventoryReservationSucceeded",
        "InventoryReservationFailed",
        "PaymentSucceeded",
        "PaymentFailed",
    ];

    pub fn order_created(order_id: OrderId, items: Vec<Sku>) -> Self {
        SagaEvent::OrderCreated(OrderCreated { order_id, items })
    }

    pub fn reservation_succeeded(order_id: OrderId) -> Self {
        SagaEvent::InventoryReservationSucceeded(ReservationSucceeded { order_id })
    }

    pub fn reservation_failed(order_id: OrderId, unavailable: Vec<Sku>) -> Self {
        SagaEvent::InventoryReservationFailed(ReservationFailed {
            order_id,
            unavailable,
        })
    }

    pub fn payment_succeeded(order_id: OrderId) -> Self {
        SagaEvent::PaymentSucceeded(PaymentSucceeded { order_id })
    }

    pub fn payment_failed(order_id: OrderId) -> Self {
        SagaEvent::PaymentFailed(PaymentFailed { order_id })
    }

    /// The order this event is about. Also used as the partition key.
    pub fn order_id(&self) -> &OrderId {
        match self {
            SagaEvent::OrderCreated(e) => &e.order_id,
            SagaEvent::InventoryReservationSucceeded(e) => &e.order_id,
            SagaEvent::InventoryReservationFailed(e) => &e.order_id,
            SagaEvent::PaymentSucceeded(e) => &e.order_id,
            SagaEvent::PaymentFailed(e) => &e.order_id,
        }
    }

    /// Returns the event type name (matches the serialized `type` tag).
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => "OrderCreated",
            SagaEvent::InventoryReservationSucceeded(_) => "InventoryReservationSucceeded",
            SagaEvent::InventoryReservationFailed(_) => "InventoryReservationFailed",
            SagaEvent::PaymentSucceeded(_) => "PaymentSucceeded",
            SagaEvent::PaymentFailed(_) => "PaymentFailed",
        }
    }

    /// The topic this event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => ORDER_EVENTS,
            SagaEvent::InventoryReservationSucceeded(_)
            | SagaEvent::InventoryReservationFailed(_) => INVENTORY_EVENTS,
            SagaEvent::PaymentSucceeded(_) | SagaEvent::PaymentFailed(_) => PAYMENT_EVENTS,
        }
    }

    /// The aggregate type recorded on the outbox row.
    pub fn aggregate_type(&self) -> &'static str {
        match self {
            SagaEvent::OrderCreated(_) => "order",
            SagaEvent::InventoryReservationSucceeded(_)
            | SagaEvent::InventoryReservationFailed(_) => "inventory",
            SagaEvent::PaymentSucceeded(_) | SagaEvent::PaymentFailed(_) => "payment",
        }
    }
}

/// Reasons an inbound payload could not be turned into a [`SagaEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope has no event")]
    Unpopulated,

    #[error("Unknown event variant '{0}'")]
    UnknownVariant(String),

    #[error("Unsupported schema version {0}")]
    UnsupportedVersion(u16),
}

/// Versioned wrapper around a single saga event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub schema_version: u16,
    pub occurred_at: DateTime<Utc>,
    pub event: SagaEvent,
}

/// Wire shape used while decoding, so that a missing or unknown event can
/// be told apart from a malformed document.
#[derive(Deserialize)]
struct RawEnvelope {
    event_id: EventId,
    schema_version: u16,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    event: Option<serde_json::Value>,
}

impl EventEnvelope {
    /// Wraps an event with a fresh id and the current time.
    pub fn new(event: SagaEvent) -> Self {
        Self {
            event_id: EventId::new(),
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        if raw.schema_version > SCHEMA_VERSION {
            return Err(DecodeError::UnsupportedVersion(raw.schema_version));
        }

        let value = match raw.event {
            None | Some(serde_json::Value::Null) => return Err(DecodeError::Unpopulated),
            Some(value) => value,
        };

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or(DecodeError::Unpopulated)?;
        if !SagaEvent::VARIANTS.contains(&tag.as_str()) {
            return Err(DecodeError::UnknownVariant(tag));
        }

        Ok(Self {
            event_id: raw.event_id,
            schema_version: raw.schema_version,
            occurred_at: raw.occurred_at,
            event: serde_json::from_value(value)?,
        })
    }
}
