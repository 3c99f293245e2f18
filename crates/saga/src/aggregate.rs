//! Saga aggregate root.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{SagaId, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SagaError};
use crate::state::{ParkReason, SagaStatus, StepStatus};
use crate::step::{SagaStep, elapsed_beyond};

/// Default number of saga-level recovery attempts.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// An ordered set of steps forming one business transaction.
///
/// The saga owns its steps as a value collection. Step order is fixed when a
/// step is appended and never renumbered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    pub(crate) id: SagaId,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) saga_type: String,
    pub(crate) correlation_id: String,
    pub(crate) status: SagaStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) failed_at: Option<DateTime<Utc>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retry_attempts: u32,
    pub(crate) current_retry_attempt: u32,
    pub(crate) steps: Vec<SagaStep>,
    pub(crate) current_step_index: usize,
    pub(crate) context: BTreeMap<String, Value>,
    pub(crate) error_message: Option<String>,
    pub(crate) parked: Option<ParkReason>,
    pub(crate) skipped_compensations: Vec<u32>,
    pub(crate) version: Version,
}

impl Saga {
    /// Creates an empty saga in the `Created` state.
    pub fn new(
        saga_type: impl Into<String>,
        name: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: SagaId::new(),
            name: name.into(),
            description: String::new(),
            saga_type: saga_type.into(),
            correlation_id: correlation_id.into(),
            status: SagaStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            timeout: None,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            current_retry_attempt: 0,
            steps: Vec::new(),
            current_step_index: 0,
            context: BTreeMap::new(),
            error_message: None,
            parked: None,
            skipped_compensations: Vec::new(),
            version: Version::initial(),
        }
    }

    /// Returns a builder that finalizes the step list before the saga can start.
    pub fn builder(
        saga_type: impl Into<String>,
        name: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> SagaBuilder {
        SagaBuilder {
            saga: Saga::new(saga_type, name, correlation_id),
        }
    }

    /// Appends a step, assigning it the next order. Only allowed before `start`.
    pub fn add_step(&mut self, step: SagaStep) -> Result<u32> {
        if self.status != SagaStatus::Created {
            return Err(SagaError::InvalidTransition {
                action: "add a step to",
                from: self.status,
            });
        }
        Ok(self.append(step))
    }

    fn append(&mut self, mut step: SagaStep) -> u32 {
        let order = self.steps.len() as u32;
        step.order = order;
        step.saga_id = Some(self.id);
        self.steps.push(step);
        order
    }

    /// `Created → Running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_start() {
            return Err(SagaError::InvalidTransition {
                action: "start",
                from: self.status,
            });
        }
        self.status = SagaStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// `Running → Completed`; every step must be `Completed`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != SagaStatus::Running {
            return Err(SagaError::InvalidTransition {
                action: "complete",
                from: self.status,
            });
        }
        let completed = self.count_steps(StepStatus::Completed);
        if completed != self.steps.len() {
            return Err(SagaError::StepsIncomplete {
                completed,
                total: self.steps.len(),
            });
        }
        self.status = SagaStatus::Completed;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Enters compensation. Running the compensating actions is the caller's job.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_fail() {
            return Err(SagaError::InvalidTransition {
                action: "fail",
                from: self.status,
            });
        }
        self.status = SagaStatus::Compensating;
        self.failed_at = Some(now);
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// `Compensating → Compensated`, once no compensable work remains.
    ///
    /// Completed steps without a compensating action do not block this; they
    /// are reported through [`Saga::is_partially_compensated`].
    pub fn compensate(&mut self) -> Result<()> {
        if self.status != SagaStatus::Compensating {
            return Err(SagaError::InvalidTransition {
                action: "mark compensated",
                from: self.status,
            });
        }
        let outstanding = self
            .steps
            .iter()
            .filter(|step| match step.status {
                StepStatus::Completed => step.has_compensation(),
                StepStatus::Compensating | StepStatus::CompensationFailed => true,
                _ => false,
            })
            .count();
        if outstanding > 0 {
            return Err(SagaError::CompensationPending(outstanding));
        }
        self.status = SagaStatus::Compensated;
        self.parked = None;
        Ok(())
    }

    /// `Compensating → Failed`: an operator abandons a saga whose remaining
    /// compensation will not be attempted again.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != SagaStatus::Compensating {
            return Err(SagaError::InvalidTransition {
                action: "abandon",
                from: self.status,
            });
        }
        self.status = SagaStatus::Failed;
        self.failed_at.get_or_insert(now);
        self.parked = None;
        Ok(())
    }

    /// Returns the lowest-order `Pending` step.
    pub fn get_next_step(&self) -> Option<&SagaStep> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .min_by_key(|step| step.order)
    }

    /// Mutable access to the lowest-order `Pending` step, for callers that
    /// edit a step's payload or limits before it runs.
    pub fn get_next_step_mut(&mut self) -> Option<&mut SagaStep> {
        self.steps
            .iter_mut()
            .filter(|step| step.status == StepStatus::Pending)
            .min_by_key(|step| step.order)
    }

    /// Returns the step currently `Running`, left behind by an interrupted worker.
    pub fn in_flight_step(&self) -> Option<&SagaStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Running)
    }

    /// Returns all `Completed` steps in descending order.
    pub fn get_steps_to_compensate(&self) -> Vec<&SagaStep> {
        let mut steps: Vec<&SagaStep> = self
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .collect();
        steps.sort_by(|a, b| b.order.cmp(&a.order));
        steps
    }

    /// Like [`Saga::get_steps_to_compensate`], but also includes steps whose
    /// compensation was started and never recorded as finished.
    pub fn steps_awaiting_compensation(&self) -> Vec<&SagaStep> {
        let mut steps: Vec<&SagaStep> = self
            .steps
            .iter()
            .filter(|step| {
                matches!(
                    step.status,
                    StepStatus::Completed | StepStatus::Compensating
                )
            })
            .collect();
        steps.sort_by(|a, b| b.order.cmp(&a.order));
        steps
    }

    /// True iff a timeout and a start time are set and the saga has run
    /// longer than its timeout.
    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        elapsed_beyond(self.started_at, self.timeout, now)
    }

    /// True iff every step is `Completed`.
    pub fn all_steps_completed(&self) -> bool {
        self.count_steps(StepStatus::Completed) == self.steps.len()
    }

    fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }
}

// Step transitions routed through the saga so derived fields stay consistent.
impl Saga {
    pub fn start_step(&mut self, order: u32, now: DateTime<Utc>) -> Result<()> {
        self.step_mut(order)?.start(now)
    }

    /// Completes a step and folds its response into the saga context.
    pub fn complete_step(&mut self, order: u32, response: Value, now: DateTime<Utc>) -> Result<()> {
        let step = self.step_mut(order)?;
        step.complete(response.clone(), now)?;
        let name = step.name.clone();
        self.merge_context(&name, response);
        self.current_step_index = (order as usize + 1).min(self.steps.len());
        Ok(())
    }

    pub fn fail_step(&mut self, order: u32, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.step_mut(order)?.fail(error, now)
    }

    pub fn increment_step_retry(&mut self, order: u32) -> Result<u32> {
        let step = self.step_mut(order)?;
        step.increment_retry();
        Ok(step.retry_attempts)
    }

    pub fn start_step_compensation(&mut self, order: u32, now: DateTime<Utc>) -> Result<()> {
        self.step_mut(order)?.start_compensation(now)
    }

    pub fn complete_step_compensation(&mut self, order: u32, now: DateTime<Utc>) -> Result<()> {
        self.step_mut(order)?.complete_compensation(now)
    }

    pub fn fail_step_compensation(
        &mut self,
        order: u32,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.step_mut(order)?.fail_compensation(reason, now)
    }

    /// Notes that a completed step was left in place because it has no
    /// compensating action.
    pub fn record_skipped_compensation(&mut self, order: u32) {
        if !self.skipped_compensations.contains(&order) {
            self.skipped_compensations.push(order);
        }
    }

    /// Reopens every `CompensationFailed` step so compensation can run again.
    /// Returns the number of reopened steps.
    pub fn reopen_failed_compensations(&mut self) -> Result<usize> {
        let mut reopened = 0;
        for step in self
            .steps
            .iter_mut()
            .filter(|step| step.status == StepStatus::CompensationFailed)
        {
            step.reopen_compensation()?;
            reopened += 1;
        }
        Ok(reopened)
    }

    fn step_mut(&mut self, order: u32) -> Result<&mut SagaStep> {
        self.steps
            .get_mut(order as usize)
            .ok_or(SagaError::StepNotFound(order))
    }
}

// Context, parking and bookkeeping
impl Saga {
    /// Merges a step response into the context. Object responses contribute
    /// each key; any other non-null response is stored under the step name.
    pub fn merge_context(&mut self, step_name: &str, response: Value) {
        match response {
            Value::Object(fields) => self.context.extend(fields),
            Value::Null => {}
            other => {
                self.context.insert(step_name.to_string(), other);
            }
        }
    }

    pub fn set_context_value(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    /// Sets the aside-for-operator flag. Parked sagas are not picked up by workers.
    pub fn park(&mut self, reason: ParkReason) {
        self.parked = Some(reason);
    }

    pub fn unpark(&mut self) {
        self.parked = None;
    }

    /// Counts a resumption of interrupted work. Returns false once the
    /// saga-level retry budget is spent.
    pub fn record_recovery_attempt(&mut self) -> bool {
        if self.current_retry_attempt >= self.max_retry_attempts {
            return false;
        }
        self.current_retry_attempt += 1;
        true
    }

    /// Orders of steps whose compensation failed.
    pub fn failed_compensations(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::CompensationFailed)
            .map(|step| step.order)
            .collect()
    }

    /// True if some completed work was not undone, either because a
    /// compensation failed or because the step had no compensating action.
    pub fn is_partially_compensated(&self) -> bool {
        !self.skipped_compensations.is_empty() || !self.failed_compensations().is_empty()
    }

    /// True if a worker should keep driving this saga.
    pub fn is_runnable(&self) -> bool {
        !self.status.is_terminal() && self.parked.is_none()
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

// Query methods
impl Saga {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
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

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    pub fn current_retry_attempt(&self) -> u32 {
        self.current_retry_attempt
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn step(&self, order: u32) -> Option<&SagaStep> {
        self.steps.get(order as usize)
    }

    /// Always equal to `steps().len()`.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn parked(&self) -> Option<ParkReason> {
        self.parked
    }

    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }

    pub fn skipped_compensations(&self) -> &[u32] {
        &self.skipped_compensations
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

/// Assembles a saga in the `Created` state.
#[derive(Debug)]
pub struct SagaBuilder {
    saga: Saga,
}

impl SagaBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.saga.description = description.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.saga.timeout = Some(timeout);
        self
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.saga.max_retry_attempts = attempts;
        self
    }

    pub fn context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.saga.context = context;
        self
    }

    pub fn step(mut self, step: SagaStep) -> Self {
        self.saga.append(step);
        self
    }

    pub fn build(self) -> Saga {
        self.saga
    }
}
