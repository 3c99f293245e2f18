//! Saga error types.

use thiserror::Error;

use crate::state::{SagaStatus, StepStatus};

/// Errors raised by the saga and step state machines.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga is in a state that does not allow the requested operation.
    #[error("Invalid saga transition: cannot {action} a saga in {from} state")]
    InvalidTransition {
        action: &'static str,
        from: SagaStatus,
    },

    /// A step is in a state that does not allow the requested operation.
    #[error("Invalid transition for step {order} '{step}': cannot {action} from {from}")]
    InvalidStepTransition {
        step: String,
        order: u32,
        action: &'static str,
        from: StepStatus,
    },

    /// `complete` was called while some steps were not completed.
    #[error("Saga cannot complete: {completed} of {total} steps completed")]
    StepsIncomplete { completed: usize, total: usize },

    /// `compensate` was called while compensation work remains.
    #[error("Saga cannot be marked compensated: {0} step(s) still need compensation")]
    CompensationPending(usize),

    /// No step exists at the given order.
    #[error("Step not found at order {0}")]
    StepNotFound(u32),

    /// A persisted record violates the saga's structural invariants.
    #[error("Corrupt saga record: {0}")]
    CorruptRecord(String),

    /// A persisted status string is not recognised.
    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
