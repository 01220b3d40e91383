//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use inventory::LedgerError;
use order::OrderError;
use payment::PaymentError;
use serde_json::{Value, json};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Order saga error.
    Order(OrderError),
    /// Payment recording error.
    Payment(PaymentError),
    /// Stock ledger error.
    Inventory(LedgerError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Order(err) => order_error_to_response(err),
            ApiError::Payment(err) => payment_error_to_response(err),
            ApiError::Inventory(err) => ledger_error_to_response(err),
            ApiError::Internal(msg) => internal(msg),
        };

        (status, axum::Json(body)).into_response()
    }
}

fn internal(msg: String) -> (StatusCode, Value) {
    tracing::error!(error = %msg, "internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg }))
}

fn order_error_to_response(err: OrderError) -> (StatusCode, Value) {
    let message = err.to_string();
    match err {
        OrderError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
        OrderError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": message })),
        OrderError::ReservationConflict {
            order_id,
            unavailable,
        } => (
            StatusCode::CONFLICT,
            json!({
                "error": message,
                "order_id": order_id,
                "unavailable": unavailable,
            }),
        ),
        OrderError::CorrelationTimeout { order_id, .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            json!({
                "error": message,
                "order_id": order_id,
                "status": "Pending",
            }),
        ),
        OrderError::InvalidTransition { .. } => (StatusCode::CONFLICT, json!({ "error": message })),
        _ => internal(message),
    }
}

fn payment_error_to_response(err: PaymentError) -> (StatusCode, Value) {
    let message = err.to_string();
    match err {
        PaymentError::Conflict { order_id, recorded } => (
            StatusCode::CONFLICT,
            json!({
                "error": message,
                "order_id": order_id,
                "recorded": recorded.as_str(),
            }),
        ),
        _ => internal(message),
    }
}

fn ledger_error_to_response(err: LedgerError) -> (StatusCode, Value) {
    let message = err.to_string();
    match err {
        LedgerError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
        LedgerError::ReservationConflict { .. } => (StatusCode::CONFLICT, json!({ "error": message })),
        _ => internal(message),
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        ApiError::Order(err)
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        ApiError::Payment(err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Inventory(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{OrderId, Sku};
    use std::time::Duration;

    async fn render(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn validation_is_bad_request() {
        let (status, body) = render(OrderError::Validation("no items".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "no items");
    }

    #[tokio::test]
    async fn conflict_lists_unavailable_skus() {
        let err = OrderError::ReservationConflict {
            order_id: OrderId::new("o-1"),
            unavailable: vec![Sku::new("sku-3")],
        };
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["order_id"], "o-1");
        assert_eq!(body["unavailable"][0], "sku-3");
    }

    #[tokio::test]
    async fn timeout_carries_order_id() {
        let err = OrderError::CorrelationTimeout {
            order_id: OrderId::new("o-2"),
            waited: Duration::from_millis(10),
        };
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["order_id"], "o-2");
        assert_eq!(body["status"], "Pending");
    }

    #[tokio::test]
    async fn not_found_is_404() {
        let (status, _) = render(OrderError::NotFound(OrderId::new("o-3")).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn payment_conflict_is_409() {
        let err = PaymentError::Conflict {
            order_id: OrderId::new("o-4"),
            recorded: payment::PaymentOutcome::Failed,
        };
        let (status, body) = render(err.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["recorded"], "Failed");
    }
}
