//! Flat persistence records for sagas and their steps.
//!
//! Stores read and write these instead of reaching into the aggregate.
//! [`Saga::from_record`] checks the structural invariants so that a damaged
//! row never turns into a live saga.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{SagaId, StepId, Version};
use serde_json::Value;

use crate::aggregate::Saga;
use crate::error::{Result, SagaError};
use crate::state::{ParkReason, SagaStatus, StepStatus};
use crate::step::SagaStep;

/// One row of the `sagas` table.
#[derive(Debug, Clone)]
pub struct SagaRecord {
    pub id: SagaId,
    pub name: String,
    pub description: String,
    pub saga_type: String,
    pub correlation_id: String,
    pub status: SagaStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
    pub max_retry_attempts: u32,
    pub current_retry_attempt: u32,
    pub current_step_index: usize,
    pub context: BTreeMap<String, Value>,
    pub error_message: Option<String>,
    pub parked: Option<ParkReason>,
    pub skipped_compensations: Vec<u32>,
    pub version: Version,
    pub steps: Vec<StepRecord>,
}

/// One row of the `saga_steps` table, keyed by `(saga_id, order)`.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: StepId,
    pub saga_id: SagaId,
    pub order: u32,
    pub name: String,
    pub service_name: String,
    pub action_type: String,
    pub action_payload: Value,
    pub compensation_action_type: Option<String>,
    pub compensation_payload: Value,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub compensation_started_at: Option<DateTime<Utc>>,
    pub compensation_completed_at: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
    pub retry_attempts: u32,
    pub max_retries: u32,
    pub response_payload: Option<Value>,
    pub error_message: Option<String>,
    pub compensation_error: Option<String>,
}

impl Saga {
    pub fn to_record(&self) -> SagaRecord {
        SagaRecord {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            saga_type: self.saga_type.clone(),
            correlation_id: self.correlation_id.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            timeout: self.timeout,
            max_retry_attempts: self.max_retry_attempts,
            current_retry_attempt: self.current_retry_attempt,
            current_step_index: self.current_step_index,
            context: self.context.clone(),
            error_message: self.error_message.clone(),
            parked: self.parked,
            skipped_compensations: self.skipped_compensations.clone(),
            version: self.version,
            steps: self
                .steps
                .iter()
                .map(|step| step.to_record(self.id))
                .collect(),
        }
    }

    /// Rebuilds a saga from its persisted form.
    pub fn from_record(mut record: SagaRecord) -> Result<Self> {
        record.steps.sort_by_key(|step| step.order);

        for (position, step) in record.steps.iter().enumerate() {
            if step.order as usize != position {
                return Err(SagaError::CorruptRecord(format!(
                    "saga {} has step order {} at position {position}",
                    record.id, step.order
                )));
            }
            if step.saga_id != record.id {
                return Err(SagaError::CorruptRecord(format!(
                    "step {} belongs to saga {}, not {}",
                    step.id, step.saga_id, record.id
                )));
            }
        }
        if record.current_step_index > record.steps.len() {
            return Err(SagaError::CorruptRecord(format!(
                "saga {} has current step index {} beyond {} steps",
                record.id,
                record.current_step_index,
                record.steps.len()
            )));
        }

        Ok(Self {
            id: record.id,
            name: record.name,
            description: record.description,
            saga_type: record.saga_type,
            correlation_id: record.correlation_id,
            status: record.status,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            failed_at: record.failed_at,
            timeout: record.timeout,
            max_retry_attempts: record.max_retry_attempts,
            current_retry_attempt: record.current_retry_attempt,
            steps: record.steps.into_iter().map(SagaStep::from_record).collect(),
            current_step_index: record.current_step_index,
            context: record.context,
            error_message: record.error_message,
            parked: record.parked,
            skipped_compensations: record.skipped_compensations,
            version: record.version,
        })
    }
}

impl SagaStep {
    fn to_record(&self, saga_id: SagaId) -> StepRecord {
        StepRecord {
            id: self.id,
            saga_id: self.saga_id.unwrap_or(saga_id),
            order: self.order,
            name: self.name.clone(),
            service_name: self.service_name.clone(),
            action_type: self.action_type.clone(),
            action_payload: self.action_payload.clone(),
            compensation_action_type: self.compensation_action_type.clone(),
            compensation_payload: self.compensation_payload.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            compensation_started_at: self.compensation_started_at,
            compensation_completed_at: self.compensation_completed_at,
            timeout: self.timeout,
            retry_attempts: self.retry_attempts,
            max_retries: self.max_retries,
            response_payload: self.response_payload.clone(),
            error_message: self.error_message.clone(),
            compensation_error: self.compensation_error.clone(),
        }
    }

    fn from_record(record: StepRecord) -> Self {
        Self {
            id: record.id,
            saga_id: Some(record.saga_id),
            order: record.order,
            name: record.name,
            service_name: record.service_name,
            action_type: record.action_type,
            action_payload: record.action_payload,
            compensation_action_type: record.compensation_action_type,
            compensation_payload: record.compensation_payload,
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            failed_at: record.failed_at,
            compensation_started_at: record.compensation_started_at,
            compensation_completed_at: record.compensation_completed_at,
            timeout: record.timeout,
            retry_attempts: record.retry_attempts,
            max_retries: record.max_retries,
            response_payload: record.response_payload,
            error_message: record.error_message,
            compensation_error: record.compensation_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_saga() -> Saga {
        let mut saga = Saga::builder("DealerOnboarding", "onboard", "corr-7")
            .timeout(Duration::from_secs(60))
            .step(
                SagaStep::new("create_dealer", "dealers", "CreateDealer", json!({"name": "Acme"}))
                    .with_compensation("DeleteDealer", json!({})),
            )
            .step(SagaStep::new("notify", "mail", "SendWelcome", Value::Null))
            .build();
        let now = Utc::now();
        saga.start(now).unwrap();
        saga.start_step(0, now).unwrap();
        saga.complete_step(0, json!({"dealer_id": "D-1"}), now).unwrap();
        saga
    }

    #[test]
    fn test_record_preserves_state() {
        let saga = sample_saga();
        let restored = Saga::from_record(saga.to_record()).unwrap();

        assert_eq!(restored.id(), saga.id());
        assert_eq!(restored.status(), SagaStatus::Running);
        assert_eq!(restored.current_step_index(), 1);
        assert_eq!(restored.context()["dealer_id"], json!("D-1"));
        assert_eq!(restored.steps()[0].status(), StepStatus::Completed);
        assert_eq!(restored.steps()[1].saga_id(), Some(saga.id()));
        assert_eq!(restored.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_record_sorts_steps_by_order() {
        let mut record = sample_saga().to_record();
        record.steps.reverse();
        let restored = Saga::from_record(record).unwrap();
        assert_eq!(restored.steps()[0].name(), "create_dealer");
    }

    #[test]
    fn test_from_record_rejects_gaps_in_order() {
        let mut record = sample_saga().to_record();
        record.steps[1].order = 5;
        assert!(matches!(
            Saga::from_record(record),
            Err(SagaError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_from_record_rejects_foreign_steps() {
        let mut record = sample_saga().to_record();
        record.steps[0].saga_id = SagaId::new();
        assert!(Saga::from_record(record).is_err());
    }

    #[test]
    fn test_from_record_rejects_index_beyond_steps() {
        let mut record = sample_saga().to_record();
        record.current_step_index = 3;
        assert!(Saga::from_record(record).is_err());
    }
}
