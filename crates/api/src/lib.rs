//! HTTP API server with observability for the saga orchestrator.
//!
//! Provides REST endpoints for saga definitions, starting sagas and the
//! operator actions on parked sagas, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{
    InMemoryStepExecutor, Orchestrator, OrchestratorConfig, OrchestratorError, StepExecutor,
};
use saga_store::{InMemorySagaStore, SagaStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// `"postgres"` or `"memory"`, reported by the health check.
    pub store_backend: &'static str,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/definitions", get(routes::definitions::list))
        .route("/definitions", post(routes::definitions::register))
        .route("/sagas", post(routes::sagas::start))
        .route("/sagas/attention", get(routes::sagas::attention))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel))
        .route(
            "/sagas/{id}/resume-compensation",
            post(routes::sagas::resume_compensation),
        )
        .route("/sagas/{id}/abandon", post(routes::sagas::abandon))
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

/// Builds the application state around the given store and step executor.
///
/// Fails when the orchestrator configuration does not validate.
pub fn create_state(
    store: Arc<dyn SagaStore>,
    store_backend: &'static str,
    executor: Arc<dyn StepExecutor>,
    config: OrchestratorConfig,
) -> Result<Arc<AppState>, OrchestratorError> {
    Ok(Arc::new(AppState {
        orchestrator: Arc::new(Orchestrator::new(store, executor, config)?),
        store_backend,
    }))
}

/// Creates state backed by the in-memory store and the in-memory executor.
///
/// The executor handle is returned so callers can script step outcomes.
pub fn create_default_state(
    config: OrchestratorConfig,
) -> Result<(Arc<AppState>, InMemorySagaStore, InMemoryStepExecutor), OrchestratorError> {
    let store = InMemorySagaStore::new();
    let executor = InMemoryStepExecutor::new();
    let state = create_state(
        Arc::new(store.clone()),
        "memory",
        Arc::new(executor.clone()),
        config,
    )?;
    Ok((state, store, executor))
}
