//! Payment outcome endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use order::{OrderError, OrderStatus};
use payment::{PaymentOutcome, Recorded};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::orders::parse_order_id;

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub order_id: String,
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
}

/// POST /payments/{order_id}/succeed
pub async fn succeed(
    state: State<AppState>,
    order_id: Path<String>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    record(state, order_id, PaymentOutcome::Succeeded).await
}

/// POST /payments/{order_id}/fail
pub async fn fail(
    state: State<AppState>,
    order_id: Path<String>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    record(state, order_id, PaymentOutcome::Failed).await
}

/// Records the outcome: 201 the first time, 200 when the same outcome was
/// already recorded, 409 when a different one was or when the order is not
/// awaiting payment.
#[tracing::instrument(skip(state))]
async fn record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    outcome: PaymentOutcome,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    let order_id = parse_order_id(&id)?;
    // 404 for unknown orders instead of an event nobody can apply.
    let order = state.orders.get_order(&order_id).await?;
    // A first outcome needs reserved stock; repeats are answered from the record.
    if order.status != OrderStatus::AwaitingPayment && state.payments.get(&order_id).await?.is_none() {
        return Err(OrderError::InvalidTransition {
            order_id,
            from: order.status,
            to: target_status(outcome),
        }
        .into());
    }

    let recorded = state.payments.record(&order_id, outcome).await?;
    let status = match recorded {
        Recorded::New(_) => StatusCode::CREATED,
        Recorded::Existing(_) => StatusCode::OK,
    };
    let record = recorded.record();
    Ok((
        status,
        Json(PaymentResponse {
            order_id: record.order_id.to_string(),
            outcome: record.outcome.to_string(),
            recorded_at: record.recorded_at,
        }),
    ))
}

fn target_status(outcome: PaymentOutcome) -> OrderStatus {
    match outcome {
        PaymentOutcome::Succeeded => OrderStatus::Paid,
        PaymentOutcome::Failed => OrderStatus::Failed,
    }
}
