//! HTTP surface and process wiring for the order fulfillment saga.
//!
//! The order, inventory and payment services each own a store with its
//! outbox, a relay publishing that outbox, and a router consuming the topics
//! they react to. All three share one partitioned bus.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use inventory::{
    InMemoryStockStore, InventoryEventHandler, PostgresStockStore, ReservationLedger, StockStore,
};
use messaging::events::{INVENTORY_EVENTS, ORDER_EVENTS, PAYMENT_EVENTS};
use messaging::{BusError, EventBus, EventRouter, InMemoryEventBus, OutboxRelay, OutboxStore};
use metrics_exporter_prometheus::PrometheusHandle;
use order::{
    InMemoryOrderStore, OrderEventHandler, OrderSagaCoordinator, OrderStore, PostgresOrderStore,
    Reconciler, ReportOnly, ReservationRegistry,
};
use payment::{InMemoryPaymentStore, PaymentService, PaymentStore, PostgresPaymentStore};
use sqlx::PgPool;
use status_hub::StatusBroadcastHub;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orders: OrderSagaCoordinator,
    pub ledger: ReservationLedger,
    pub payments: PaymentService,
    pub hub: StatusBroadcastHub,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: AppState, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(routes::metrics::MetricsState {
            handle: metrics_handle,
            registry: state.orders.registry().clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/orders/{id}/events", get(routes::orders::events))
        .route("/payments/{order_id}/succeed", post(routes::payments::succeed))
        .route("/payments/{order_id}/fail", post(routes::payments::fail))
        .route("/products", get(routes::products::list))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Each service's store, seen both as its domain store and as its outbox.
#[derive(Clone)]
pub struct ServiceStores {
    pub orders: Arc<dyn OrderStore>,
    pub order_outbox: Arc<dyn OutboxStore>,
    pub stock: Arc<dyn StockStore>,
    pub stock_outbox: Arc<dyn OutboxStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub payment_outbox: Arc<dyn OutboxStore>,
}

impl ServiceStores {
    pub fn in_memory() -> Self {
        let orders = InMemoryOrderStore::new();
        let stock = InMemoryStockStore::new();
        let payments = InMemoryPaymentStore::new();
        Self {
            orders: Arc::new(orders.clone()),
            order_outbox: Arc::new(orders),
            stock: Arc::new(stock.clone()),
            stock_outbox: Arc::new(stock),
            payments: Arc::new(payments.clone()),
            payment_outbox: Arc::new(payments),
        }
    }

    /// All three services on one database, each with its own tables.
    pub fn postgres(pool: PgPool) -> Self {
        let orders = PostgresOrderStore::new(pool.clone());
        let stock = PostgresStockStore::new(pool.clone());
        let payments = PostgresPaymentStore::new(pool);
        Self {
            orders: Arc::new(orders.clone()),
            order_outbox: Arc::new(orders),
            stock: Arc::new(stock.clone()),
            stock_outbox: Arc::new(stock),
            payments: Arc::new(payments.clone()),
            payment_outbox: Arc::new(payments),
        }
    }
}

/// Consumer group and topics of one service's router.
#[derive(Clone)]
pub struct RouterBinding {
    pub router: EventRouter,
    pub group: &'static str,
    pub topics: &'static [&'static str],
}

/// The three services wired onto one bus, ready to be started.
pub struct SagaRuntime {
    pub state: AppState,
    pub bus: InMemoryEventBus,
    pub relays: Vec<OutboxRelay>,
    pub order_router: RouterBinding,
    pub inventory_router: RouterBinding,
    pub reconciler: Arc<Reconciler>,
}

impl SagaRuntime {
    pub fn new(stores: ServiceStores, config: &Config) -> Self {
        let bus = InMemoryEventBus::new(config.bus_partitions);
        let shared_bus: Arc<dyn EventBus> = Arc::new(bus.clone());
        let retry = config.retry_policy();
        let relay_config = config.relay_config();

        let registry = ReservationRegistry::new();
        let hub = StatusBroadcastHub::default();
        let orders = OrderSagaCoordinator::new(
            stores.orders.clone(),
            registry.clone(),
            config.reservation_timeout,
        );
        let ledger = ReservationLedger::new(stores.stock.clone());
        let payments = PaymentService::new(stores.payments.clone());

        let relays = vec![
            OutboxRelay::new("order", stores.order_outbox, shared_bus.clone(), relay_config),
            OutboxRelay::new("inventory", stores.stock_outbox, shared_bus.clone(), relay_config),
            OutboxRelay::new("payment", stores.payment_outbox, shared_bus, relay_config),
        ];

        let order_router = RouterBinding {
            router: EventRouter::new(
                "order",
                Arc::new(OrderEventHandler::new(
                    stores.orders.clone(),
                    registry.clone(),
                    hub.clone(),
                )),
                retry,
            )
            .with_dead_letter_capacity(config.dead_letter_capacity),
            group: "order-service",
            topics: &[INVENTORY_EVENTS, PAYMENT_EVENTS],
        };
        let inventory_router = RouterBinding {
            router: EventRouter::new(
                "inventory",
                Arc::new(InventoryEventHandler::new(ledger.clone())),
                retry,
            )
            .with_dead_letter_capacity(config.dead_letter_capacity),
            group: "inventory-service",
            topics: &[ORDER_EVENTS, PAYMENT_EVENTS],
        };

        let reconciler = Arc::new(Reconciler::new(
            stores.orders,
            registry,
            hub.clone(),
            Arc::new(ReportOnly),
            config.reconcile_config(),
        ));

        Self {
            state: AppState {
                orders,
                ledger,
                payments,
                hub,
            },
            bus,
            relays,
            order_router,
            inventory_router,
            reconciler,
        }
    }

    /// Spawns relays and router workers. They stop when `shutdown` flips to
    /// true or the bus closes.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut tasks = Vec::new();
        for binding in [&self.order_router, &self.inventory_router] {
            tasks.extend(
                binding
                    .router
                    .start(&self.bus, binding.topics, binding.group, shutdown.clone())
                    .await?,
            );
        }
        for relay in &self.relays {
            tasks.push(tokio::spawn(relay.clone().run(shutdown.clone())));
        }
        Ok(tasks)
    }

    /// Spawns the periodic reconciliation sweep.
    pub fn start_reconciler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    }
}
