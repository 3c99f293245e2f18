//! Saga start, inspection and operator endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use saga::{Saga, SagaId, SagaStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub saga_type: String,
    pub correlation_id: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Drive the saga inline and answer with its final state.
    #[serde(default)]
    pub wait: bool,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub id: String,
    pub saga_type: String,
    pub name: String,
    pub correlation_id: String,
    pub status: String,
    pub parked: Option<String>,
    pub error_message: Option<String>,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub context: BTreeMap<String, Value>,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub order: u32,
    pub name: String,
    pub service_name: String,
    pub action_type: String,
    pub status: String,
    pub retry_attempts: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub compensation_error: Option<String>,
}

#[derive(Serialize)]
pub struct SagaSummary {
    pub id: String,
    pub saga_type: String,
    pub correlation_id: String,
    pub status: String,
    pub parked: Option<String>,
    pub failed_compensations: Vec<u32>,
    pub error_message: Option<String>,
}

impl From<&SagaStep> for StepResponse {
    fn from(step: &SagaStep) -> Self {
        Self {
            order: step.order(),
            name: step.name().to_string(),
            service_name: step.service_name().to_string(),
            action_type: step.action_type().to_string(),
            status: step.status().to_string(),
            retry_attempts: step.retry_attempts(),
            max_retries: step.max_retries(),
            error_message: step.error_message().map(str::to_string),
            compensation_error: step.compensation_error().map(str::to_string),
        }
    }
}

impl From<&Saga> for SagaResponse {
    fn from(saga: &Saga) -> Self {
        Self {
            id: saga.id().to_string(),
            saga_type: saga.saga_type().to_string(),
            name: saga.name().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            status: saga.status().to_string(),
            parked: saga.parked().map(|reason| reason.to_string()),
            error_message: saga.error_message().map(str::to_string),
            current_step_index: saga.current_step_index(),
            total_steps: saga.total_steps(),
            created_at: saga.created_at(),
            started_at: saga.started_at(),
            completed_at: saga.completed_at(),
            failed_at: saga.failed_at(),
            context: saga.context().clone(),
            steps: saga.steps().iter().map(StepResponse::from).collect(),
        }
    }
}

impl From<&Saga> for SagaSummary {
    fn from(saga: &Saga) -> Self {
        Self {
            id: saga.id().to_string(),
            saga_type: saga.saga_type().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            status: saga.status().to_string(),
            parked: saga.parked().map(|reason| reason.to_string()),
            failed_compensations: saga.failed_compensations(),
            error_message: saga.error_message().map(str::to_string),
        }
    }
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}

// -- Handlers --

/// POST /sagas: create a saga from a registered definition.
///
/// Answers 202 with the `Created` saga for the workers to pick up. With
/// `wait` set the saga is driven inline, or awaited if a worker got to it
/// first, and the answer is 200 with its final or parked state. A saga still
/// running when the wait runs out is answered with 202.
#[tracing::instrument(skip(state, req), fields(saga_type = %req.saga_type))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaResponse>), ApiError> {
    if req.correlation_id.trim().is_empty() {
        return Err(ApiError::BadRequest("correlation_id is required".to_string()));
    }

    let outcomes = state.orchestrator.subscribe();
    let saga = state
        .orchestrator
        .start_saga(&req.saga_type, &req.correlation_id, req.context)
        .await?;

    if !req.wait {
        return Ok((StatusCode::ACCEPTED, Json(SagaResponse::from(&saga))));
    }

    let saga = state.orchestrator.run_or_await(saga.id(), outcomes).await?;
    let status = if saga.is_runnable() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(SagaResponse::from(&saga))))
}

/// GET /sagas/{id}: current state of a saga and its steps.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = state.orchestrator.get(parse_saga_id(&id)?).await?;
    Ok(Json(SagaResponse::from(&saga)))
}

/// POST /sagas/{id}/cancel: abort a saga and compensate what it did.
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = state.orchestrator.cancel(parse_saga_id(&id)?).await?;
    Ok(Json(SagaResponse::from(&saga)))
}

/// POST /sagas/{id}/resume-compensation: retry failed compensations of a parked saga.
#[tracing::instrument(skip(state))]
pub async fn resume_compensation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = state
        .orchestrator
        .resume_compensation(parse_saga_id(&id)?)
        .await?;
    Ok(Json(SagaResponse::from(&saga)))
}

/// POST /sagas/{id}/abandon: give up on a parked saga and mark it failed.
#[tracing::instrument(skip(state))]
pub async fn abandon(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = state.orchestrator.abandon(parse_saga_id(&id)?).await?;
    Ok(Json(SagaResponse::from(&saga)))
}

/// GET /sagas/attention: parked sagas waiting for an operator.
pub async fn attention(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SagaSummary>>, ApiError> {
    let sagas = state.orchestrator.requiring_attention().await?;
    Ok(Json(sagas.iter().map(SagaSummary::from).collect()))
}
