//! Saga definition registry endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use orchestrator::SagaDefinition;

use crate::AppState;
use crate::error::ApiError;

/// GET /definitions: every registered definition, sorted by saga type.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<SagaDefinition>> {
    Json(state.orchestrator.definitions().list())
}

/// POST /definitions: register a definition, replacing one of the same type.
///
/// Answers 201 for a new saga type and 200 when an existing one was replaced.
#[tracing::instrument(skip(state, definition), fields(saga_type = %definition.saga_type))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<SagaDefinition>,
) -> Result<(StatusCode, Json<SagaDefinition>), ApiError> {
    let replaced = state
        .orchestrator
        .definitions()
        .register(definition.clone())?;

    let status = if replaced.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(definition)))
}
