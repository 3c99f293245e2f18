//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub worker_id: String,
    pub definitions: usize,
}

/// GET /health: liveness plus which store and worker identity are in use.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.store_backend,
        worker_id: state.orchestrator.config().worker_id.clone(),
        definitions: state.orchestrator.definitions().len(),
    })
}
