//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Create-order requests currently waiting for a reservation outcome.
    pub waiting_reservations: usize,
}

/// GET /health
pub async fn check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        waiting_reservations: state.orders.registry().len(),
    })
}
