//! A single unit of work within a saga.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{SagaId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SagaError};
use crate::state::StepStatus;

/// Default number of retries for a step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A step targeting one remote service, with an optional compensating action.
///
/// The step refers to its saga by id only; the [`Saga`](crate::Saga) owns the
/// step collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    pub(crate) id: StepId,
    pub(crate) saga_id: Option<SagaId>,
    pub(crate) order: u32,
    pub(crate) name: String,
    pub(crate) service_name: String,
    pub(crate) action_type: String,
    pub(crate) action_payload: Value,
    pub(crate) compensation_action_type: Option<String>,
    pub(crate) compensation_payload: Value,
    pub(crate) status: StepStatus,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) failed_at: Option<DateTime<Utc>>,
    pub(crate) compensation_started_at: Option<DateTime<Utc>>,
    pub(crate) compensation_completed_at: Option<DateTime<Utc>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_attempts: u32,
    pub(crate) max_retries: u32,
    pub(crate) response_payload: Option<Value>,
    pub(crate) error_message: Option<String>,
    pub(crate) compensation_error: Option<String>,
}

impl SagaStep {
    /// Creates a pending, detached step. Its order and saga id are assigned
    /// when it is appended to a saga.
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        action_type: impl Into<String>,
        action_payload: Value,
    ) -> Self {
        Self {
            id: StepId::new(),
            saga_id: None,
            order: 0,
            name: name.into(),
            service_name: service_name.into(),
            action_type: action_type.into(),
            action_payload,
            compensation_action_type: None,
            compensation_payload: Value::Null,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            failed_at: None,
            compensation_started_at: None,
            compensation_completed_at: None,
            timeout: None,
            retry_attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            response_payload: None,
            error_message: None,
            compensation_error: None,
        }
    }

    /// Sets the action that undoes this step.
    pub fn with_compensation(mut self, action_type: impl Into<String>, payload: Value) -> Self {
        self.compensation_action_type = Some(action_type.into());
        self.compensation_payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    // -- Transitions --

    /// `Pending → Running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(StepStatus::Pending, "start")?;
        self.status = StepStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// `Running → Completed`, recording the service response.
    pub fn complete(&mut self, response: Value, now: DateTime<Utc>) -> Result<()> {
        self.require(StepStatus::Running, "complete")?;
        self.status = StepStatus::Completed;
        self.completed_at = Some(now);
        self.response_payload = Some(response);
        self.error_message = None;
        Ok(())
    }

    /// `Running → Failed`.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.require(StepStatus::Running, "fail")?;
        self.status = StepStatus::Failed;
        self.failed_at = Some(now);
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Returns true while retries remain.
    pub fn can_retry(&self) -> bool {
        self.retry_attempts < self.max_retries
    }

    /// Counts one more attempt. The caller re-dispatches the same action afterwards.
    pub fn increment_retry(&mut self) {
        self.retry_attempts = self.retry_attempts.saturating_add(1);
    }

    /// `Completed → Compensating`.
    pub fn start_compensation(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(StepStatus::Completed, "start compensation")?;
        self.status = StepStatus::Compensating;
        self.compensation_started_at = Some(now);
        Ok(())
    }

    /// `Compensating → Compensated`.
    pub fn complete_compensation(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(StepStatus::Compensating, "complete compensation")?;
        self.status = StepStatus::Compensated;
        self.compensation_completed_at = Some(now);
        Ok(())
    }

    /// `Compensating → CompensationFailed`. Not retried automatically.
    pub fn fail_compensation(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.require(StepStatus::Compensating, "fail compensation")?;
        self.status = StepStatus::CompensationFailed;
        self.compensation_completed_at = Some(now);
        self.compensation_error = Some(reason.into());
        Ok(())
    }

    /// `CompensationFailed → Completed`, so an operator-triggered resume can
    /// attempt the compensation again.
    pub fn reopen_compensation(&mut self) -> Result<()> {
        self.require(StepStatus::CompensationFailed, "reopen compensation")?;
        self.status = StepStatus::Completed;
        self.compensation_started_at = None;
        self.compensation_completed_at = None;
        self.compensation_error = None;
        Ok(())
    }

    /// True iff a timeout and a start time are set and more than `timeout`
    /// has elapsed since the step started.
    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        elapsed_beyond(self.started_at, self.timeout, now)
    }

    /// True iff the step declares a compensating action.
    pub fn has_compensation(&self) -> bool {
        self.compensation_action_type
            .as_deref()
            .is_some_and(|action| !action.is_empty())
    }

    fn require(&self, expected: StepStatus, action: &'static str) -> Result<()> {
        if self.status != expected {
            return Err(SagaError::InvalidStepTransition {
                step: self.name.clone(),
                order: self.order,
                action,
                from: self.status,
            });
        }
        Ok(())
    }
}

// Query methods
impl SagaStep {
    pub fn id(&self) -> StepId {
        self.id
    }

    /// Returns the owning saga, once the step has been appended.
    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    /// Returns the position of the step within its saga.
    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn action_payload(&self) -> &Value {
        &self.action_payload
    }

    pub fn compensation_action_type(&self) -> Option<&str> {
        self.compensation_action_type.as_deref()
    }

    pub fn compensation_payload(&self) -> &Value {
        &self.compensation_payload
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    pub fn compensation_started_at(&self) -> Option<DateTime<Utc>> {
        self.compensation_started_at
    }

    pub fn compensation_completed_at(&self) -> Option<DateTime<Utc>> {
        self.compensation_completed_at
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn response_payload(&self) -> Option<&Value> {
        self.response_payload.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn compensation_error(&self) -> Option<&str> {
        self.compensation_error.as_deref()
    }
}

/// Shared timeout rule for sagas and steps: `now - started_at > timeout`.
pub(crate) fn elapsed_beyond(
    started_at: Option<DateTime<Utc>>,
    timeout: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    let (Some(started_at), Some(timeout)) = (started_at, timeout) else {
        return false;
    };
    match chrono::Duration::from_std(timeout) {
        Ok(limit) => now.signed_duration_since(started_at) > limit,
        // Longer than chrono can represent; never reached.
        Err(_) => false,
    }
}
