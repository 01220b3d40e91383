//! Shared setup for the API integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use api::config::Config;
use api::{SagaRuntime, ServiceStores};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::Sku;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

pub fn test_config() -> Config {
    Config {
        reservation_timeout: Duration::from_secs(3),
        outbox_poll_interval: Duration::from_millis(5),
        retry_max_attempts: 3,
        retry_initial_backoff: Duration::from_millis(1),
        bus_partitions: 2,
        reconcile_stale_after: Duration::ZERO,
        ..Config::default()
    }
}

pub struct TestApp {
    pub app: Router,
    pub runtime: SagaRuntime,
    pub shutdown: watch::Sender<bool>,
}

impl TestApp {
    /// Wires the services on in-memory stores without starting relays or routers.
    pub async fn build(config: Config, seed: &[&str]) -> Self {
        let runtime = SagaRuntime::new(ServiceStores::in_memory(), &config);
        let skus: Vec<Sku> = seed.iter().map(|s| Sku::new(*s)).collect();
        if !skus.is_empty() {
            runtime.state.ledger.seed(&skus).await.unwrap();
        }
        let app = api::create_app(runtime.state.clone(), get_metrics_handle());
        let (shutdown, _) = watch::channel(false);
        Self {
            app,
            runtime,
            shutdown,
        }
    }

    /// A running system with `seed` available.
    pub async fn spawn(seed: &[&str]) -> Self {
        Self::spawn_with(test_config(), seed).await
    }

    pub async fn spawn_with(config: Config, seed: &[&str]) -> Self {
        let app = Self::build(config, seed).await;
        app.start().await;
        app
    }

    pub async fn start(&self) {
        self.runtime
            .start(self.shutdown.subscribe())
            .await
            .unwrap();
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        // Extractor rejections answer in plain text.
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn create_order(&self, skus: &[&str]) -> (StatusCode, serde_json::Value) {
        let items: Vec<serde_json::Value> = skus
            .iter()
            .map(|sku| serde_json::json!({ "product_id": sku }))
            .collect();
        self.post_json("/orders", serde_json::json!({ "items": items }))
            .await
    }

    pub async fn order_status(&self, id: &str) -> String {
        let (status, body) = self.get(&format!("/orders/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        body["status"].as_str().unwrap().to_string()
    }

    /// Reads a whole SSE response body; the stream ends after a terminal status.
    pub async fn read_events(&self, id: &str) -> String {
        let response = self
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/orders/{id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = tokio::time::timeout(
            Duration::from_secs(5),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("event stream did not end")
        .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time: {what}");
}
