//! Saga and step state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► Running ──┬──► Completed
///    │                  └──► Compensating ──┬──► Compensated
///    └──────────────────────────►│           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Saga is being assembled; steps can still be appended.
    #[default]
    Created,

    /// Steps are being executed in order.
    Running,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A failure occurred and completed steps are being undone.
    Compensating,

    /// Every compensable step was undone (terminal state).
    Compensated,

    /// Abandoned with no further compensation pending (terminal state).
    Failed,
}

impl SagaStatus {
    /// Returns true if the saga can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, SagaStatus::Created)
    }

    /// Returns true if the saga can enter compensation.
    pub fn can_fail(&self) -> bool {
        matches!(self, SagaStatus::Created | SagaStatus::Running)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Created => "Created",
            SagaStatus::Running => "Running",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(SagaStatus::Created),
            "Running" => Ok(SagaStatus::Running),
            "Completed" => Ok(SagaStatus::Completed),
            "Compensating" => Ok(SagaStatus::Compensating),
            "Compensated" => Ok(SagaStatus::Compensated),
            "Failed" => Ok(SagaStatus::Failed),
            other => Err(SagaError::UnknownStatus(other.to_string())),
        }
    }
}

/// The state of a single step.
///
/// The forward and compensation paths are separate:
/// ```text
/// Pending ──► Running ──┬──► Completed ──► Compensating ──┬──► Compensated
///                       └──► Failed                       └──► CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Running => "Running",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensating => "Compensating",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(StepStatus::Pending),
            "Running" => Ok(StepStatus::Running),
            "Completed" => Ok(StepStatus::Completed),
            "Failed" => Ok(StepStatus::Failed),
            "Compensating" => Ok(StepStatus::Compensating),
            "Compensated" => Ok(StepStatus::Compensated),
            "CompensationFailed" => Ok(StepStatus::CompensationFailed),
            other => Err(SagaError::UnknownStatus(other.to_string())),
        }
    }
}

/// Why a saga is waiting for an operator instead of being driven further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParkReason {
    /// One or more compensating actions failed; the saga is partially compensated.
    CompensationFailed,

    /// The orchestrator found the saga in a state it cannot explain.
    InvariantViolation,
}

impl ParkReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParkReason::CompensationFailed => "CompensationFailed",
            ParkReason::InvariantViolation => "InvariantViolation",
        }
    }
}

impl std::fmt::Display for ParkReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ParkReason {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CompensationFailed" => Ok(ParkReason::CompensationFailed),
            "InvariantViolation" => Ok(ParkReason::InvariantViolation),
            other => Err(SagaError::UnknownStatus(other.to_string())),
        }
    }
}
