//! Order creation, lookup and live status endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use common::{OrderId, Sku};
use futures_util::Stream;
use order::{Order, OrderStatus};
use serde::{Deserialize, Serialize};
use status_hub::{StatusMessage, Subscription};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub status: String,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id.to_string(),
            status: order.status.to_string(),
            items: order
                .items
                .into_iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id.to_string(),
                })
                .collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

// -- Handlers --

/// POST /orders: create an order and wait for its stock reservation.
///
/// 201 with the order in `AwaitingPayment`, 409 when stock could not be
/// reserved, 504 when no outcome arrived in time (the order stays `Pending`).
#[tracing::instrument(skip(state, req), fields(item_count = req.items.len()))]
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let items: Vec<Sku> = req
        .items
        .into_iter()
        .map(|item| Sku::new(item.product_id))
        .collect();

    let order = state.orders.create_order(items).await?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

/// GET /orders/{id}: current order snapshot.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = state.orders.get_order(&parse_order_id(&id)?).await?;
    Ok(Json(order.into()))
}

/// GET /orders/{id}/events: Server-Sent Events stream of status changes.
///
/// Starts with the current status and ends after `Paid` or `Failed`.
#[tracing::instrument(skip(state))]
pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let order_id = parse_order_id(&id)?;

    // Subscribe before reading the store so no change falls in between.
    let subscription = state.hub.subscribe(&order_id);
    let order = state.orders.get_order(&order_id).await?;
    let initial = state.hub.last_status(&order_id).is_none().then(|| StatusMessage {
        order_id: order_id.clone(),
        status: order.status.to_string(),
    });

    let feed = StatusFeed {
        initial,
        subscription,
        last: None,
        finished: false,
    };
    let stream = futures_util::stream::unfold(feed, |mut feed| async move {
        let message = feed.next().await?;
        let event = match Event::default().json_data(&message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode status message");
                Event::default().data(message.status.clone())
            }
        };
        Some((Ok(event), feed))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Status messages for one SSE client, without consecutive repeats.
struct StatusFeed {
    initial: Option<StatusMessage>,
    subscription: Subscription,
    last: Option<String>,
    finished: bool,
}

impl StatusFeed {
    async fn next(&mut self) -> Option<StatusMessage> {
        if self.finished {
            return None;
        }
        loop {
            let message = match self.initial.take() {
                Some(message) => message,
                None => self.subscription.recv().await?,
            };
            if self.last.as_deref() == Some(message.status.as_str()) {
                continue;
            }
            self.finished = message
                .status
                .parse::<OrderStatus>()
                .is_ok_and(|status| status.is_terminal());
            self.last = Some(message.status.clone());
            return Some(message);
        }
    }
}

pub(crate) fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("order id must not be empty".to_string()));
    }
    Ok(OrderId::new(id))
}
