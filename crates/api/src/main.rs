//! API server entry point.

use api::config::{Config, LogFormat};
use api::{SagaRuntime, ServiceStores};
use order::PostgresOrderStore;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the stores
    let stores = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            PostgresOrderStore::new(pool.clone())
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL stores");
            ServiceStores::postgres(pool)
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory stores");
            ServiceStores::in_memory()
        }
    };

    // 4. Wire the services and seed stock
    let runtime = SagaRuntime::new(stores, &config);
    if !config.seed_skus.is_empty() {
        let seeded = runtime
            .state
            .ledger
            .seed(&config.seed_skus)
            .await
            .expect("failed to seed stock");
        tracing::info!(seeded, "stock seeded");
    }

    // 5. Start relays, routers and the reconciliation sweep
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = runtime
        .start(shutdown_rx.clone())
        .await
        .expect("failed to start event routers");
    tasks.push(runtime.start_reconciler(shutdown_rx));

    // 6. Start server
    let app = api::create_app(runtime.state.clone(), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop background work
    let _ = shutdown_tx.send(true);
    runtime.bus.close();
    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("server shut down gracefully");
}
