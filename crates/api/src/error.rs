//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orchestrator::OrchestratorError;
use saga::SagaError;
use saga_store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Orchestration error.
    Orchestrator(OrchestratorError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Orchestrator(err) => orchestrator_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn orchestrator_error_to_response(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::SagaNotFound(_) | OrchestratorError::UnknownDefinition(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::InvalidRequest { .. }
        | OrchestratorError::LeaseHeld(_)
        | OrchestratorError::NotParked(_)
        | OrchestratorError::Saga(SagaError::InvalidTransition { .. })
        | OrchestratorError::Store(StoreError::ConcurrencyConflict { .. }) => StatusCode::CONFLICT,
        _ => {
            tracing::error!(error = %err, "orchestrator error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga::{SagaId, SagaStatus};

    fn status_of(err: OrchestratorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        let id = SagaId::new();
        assert_eq!(
            status_of(OrchestratorError::SagaNotFound(id)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(OrchestratorError::InvalidDefinition("no steps".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrchestratorError::InvalidRequest {
                saga_id: id,
                action: "cancel",
                status: SagaStatus::Completed,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(OrchestratorError::LeaseHeld(id)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(OrchestratorError::InvariantViolation {
                saga_id: id,
                reason: "out of order".into(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
