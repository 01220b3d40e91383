//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use order::ReservationRegistry;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub registry: ReservationRegistry,
}

/// GET /metrics: Prometheus text format, with point-in-time gauges refreshed first.
pub async fn get(State(state): State<MetricsState>) -> impl IntoResponse {
    metrics::gauge!("correlation_pending_waiters").set(state.registry.len() as f64);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.handle.render(),
    )
}
