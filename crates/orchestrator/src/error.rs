//! Orchestrator error types.

use saga::{SagaError, SagaId, SagaStatus};
use saga_store::StoreError;
use thiserror::Error;

/// Errors that escape the orchestrator.
///
/// Step-level failures never show up here; they are absorbed into step and
/// saga transitions.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The saga does not exist.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownDefinition(String),

    /// A saga definition failed validation.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The orchestrator configuration is unusable.
    #[error("Invalid orchestrator configuration: {0}")]
    InvalidConfig(String),

    /// Another worker holds the lease on the saga.
    #[error("Saga {0} is being processed by another worker")]
    LeaseHeld(SagaId),

    /// The operator request does not apply to the saga's current state.
    #[error("Cannot {action} saga {saga_id} in {status} state")]
    InvalidRequest {
        saga_id: SagaId,
        action: &'static str,
        status: SagaStatus,
    },

    /// Only parked sagas can be abandoned.
    #[error("Saga {0} is not parked")]
    NotParked(SagaId),

    /// The saga broke a structural invariant and was parked for investigation.
    #[error("Invariant violation in saga {saga_id}: {reason}")]
    InvariantViolation { saga_id: SagaId, reason: String },

    /// A saga state machine error.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// A saga store error.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SagaNotFound(saga_id) => OrchestratorError::SagaNotFound(saga_id),
            other => OrchestratorError::Store(other),
        }
    }
}

/// Convenience type alias for orchestrator results.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
