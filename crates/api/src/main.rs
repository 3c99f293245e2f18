//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use orchestrator::{InMemoryStepExecutor, OrchestratorConfig, WorkerPool};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
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

/// Connects to Postgres when a database URL is configured, otherwise keeps
/// sagas in memory.
async fn open_store(config: &Config) -> (Arc<dyn SagaStore>, &'static str) {
    let backend = config.store_backend();
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, sagas will not survive a restart");
        return (Arc::new(InMemorySagaStore::new()), backend);
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to database");
    let store = PostgresSagaStore::new(pool);
    store
        .run_migrations()
        .await
        .expect("failed to run migrations");
    (Arc::new(store), backend)
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::routes::metrics::describe();

    // 3. Create the saga store and application state
    let (store, backend) = open_store(&config).await;
    let orchestrator_config =
        OrchestratorConfig::from_env().expect("invalid orchestrator configuration");
    // Services are not wired over the network yet; every step succeeds.
    let executor = Arc::new(InMemoryStepExecutor::new());
    let state = api::create_state(store, backend, executor, orchestrator_config)
        .expect("failed to create application state");

    // 4. Load saga definitions
    if let Some(path) = &config.definitions_path {
        let json = tokio::fs::read_to_string(path)
            .await
            .expect("failed to read saga definitions");
        let loaded = state
            .orchestrator
            .definitions()
            .load_json(&json)
            .expect("invalid saga definitions");
        tracing::info!(%path, loaded, "saga definitions loaded");
    }

    // 5. Start the worker pool
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::new(state.orchestrator.clone()).spawn(shutdown_rx);

    // 6. Build the application and start the server
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, store = backend, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Let in-flight sagas finish
    let _ = shutdown_tx.send(true);
    if let Err(err) = workers.await {
        tracing::error!(error = %err, "worker pool task failed");
    }

    tracing::info!("server shut down gracefully");
}
