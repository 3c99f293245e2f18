//! Reverse-order compensation of completed saga steps.

use std::sync::Arc;

use chrono::Utc;
use saga::{ParkReason, Saga, SagaError, SagaStatus, StepStatus};
use saga_store::{SagaStore, SagaStoreExt};

use crate::error::{OrchestratorError, Result};
use crate::executor::{Dispatcher, StepOutcome};
use crate::lease::LeaseKeeper;

/// What one compensation pass did, by step order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub compensated: Vec<u32>,
    pub failed: Vec<u32>,
    /// Completed steps without a compensating action.
    pub skipped: Vec<u32>,
}

impl CompensationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Undoes the completed steps of a `Compensating` saga, last step first.
///
/// Failed compensations are recorded and never retried here; the remaining
/// steps are still compensated. A saga with failed compensations stays
/// `Compensating` and is parked for an operator.
#[derive(Clone)]
pub struct CompensationCoordinator {
    store: Arc<dyn SagaStore>,
    dispatcher: Dispatcher,
    lease: Option<LeaseKeeper>,
}

impl CompensationCoordinator {
    pub fn new(store: Arc<dyn SagaStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            lease: None,
        }
    }

    /// Renews the saga's lease before every compensating dispatch.
    pub(crate) fn with_lease(mut self, lease: LeaseKeeper) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Runs one compensation pass over `saga`, persisting after every transition.
    ///
    /// Running it on a `Compensated` saga does nothing. Steps already
    /// `Compensated` or `CompensationFailed` are left alone.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id()))]
    pub async fn compensate(&self, saga: &mut Saga) -> Result<CompensationReport> {
        let mut report = CompensationReport::default();

        match saga.status() {
            SagaStatus::Compensated => return Ok(report),
            SagaStatus::Compensating => {}
            status => {
                return Err(OrchestratorError::Saga(SagaError::InvalidTransition {
                    action: "compensate",
                    from: status,
                }));
            }
        }

        let pending: Vec<u32> = saga
            .steps_awaiting_compensation()
            .iter()
            .map(|step| step.order())
            .collect();

        tracing::info!(steps = pending.len(), "compensation started");

        for order in pending {
            let step = saga.step(order).ok_or(SagaError::StepNotFound(order))?;
            if !step.has_compensation() {
                tracing::info!(order, step = step.name(), "no compensating action, step left in place");
                saga.record_skipped_compensation(order);
                report.skipped.push(order);
                continue;
            }
            if let Some(lease) = &self.lease {
                lease.renew(saga.id(), self.dispatcher.timeout_for(step)).await?;
            }

            if step.status() == StepStatus::Completed {
                saga.start_step_compensation(order, Utc::now())?;
                self.store.persist(saga).await?;
            }

            let outcome = {
                let step = saga.step(order).ok_or(SagaError::StepNotFound(order))?;
                self.dispatcher.dispatch_compensation(saga, step).await
            };

            let now = Utc::now();
            match outcome {
                StepOutcome::Success(_) => {
                    saga.complete_step_compensation(order, now)?;
                    report.compensated.push(order);
                    tracing::info!(order, "compensation step completed");
                }
                StepOutcome::Failure { message, .. } => {
                    saga.fail_step_compensation(order, &message, now)?;
                    report.failed.push(order);
                    metrics::counter!("saga_compensation_failures_total").increment(1);
                    tracing::warn!(order, error = %message, "compensation step failed");
                }
                StepOutcome::Timeout => {
                    saga.fail_step_compensation(order, "compensation timed out", now)?;
                    report.failed.push(order);
                    metrics::counter!("saga_compensation_failures_total").increment(1);
                    tracing::warn!(order, "compensation step timed out");
                }
            }
            self.store.persist(saga).await?;
        }

        let failed = saga.failed_compensations();
        if failed.is_empty() {
            saga.compensate()?;
            metrics::counter!("saga_compensated_total").increment(1);
            tracing::info!(skipped = ?report.skipped, "saga compensated");
        } else {
            saga.park(ParkReason::CompensationFailed);
            metrics::counter!("saga_parked_total").increment(1);
            tracing::warn!(failed_steps = ?failed, "compensation incomplete, saga parked");
        }
        self.store.persist(saga).await?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::memory::InMemoryStepExecutor;
    use saga::SagaStep;
    use saga_store::InMemorySagaStore;
    use serde_json::{Value, json};

    fn coordinator(executor: &InMemoryStepExecutor) -> (CompensationCoordinator, InMemorySagaStore) {
        let store = InMemorySagaStore::new();
        let dispatcher = Dispatcher::new(Arc::new(executor.clone()), Duration::from_secs(1));
        (
            CompensationCoordinator::new(Arc::new(store.clone()), dispatcher),
            store,
        )
    }

    /// Three completed steps, the middle one without compensation, then failed.
    async fn failed_saga(store: &InMemorySagaStore) -> Saga {
        let mut saga = Saga::builder("T", "comp", "c")
            .step(SagaStep::new("a", "svc", "DoA", Value::Null).with_compensation("UndoA", Value::Null))
            .step(SagaStep::new("b", "svc", "DoB", Value::Null))
            .step(SagaStep::new("c", "svc", "DoC", Value::Null).with_compensation("UndoC", Value::Null))
            .step(SagaStep::new("d", "svc", "DoD", Value::Null))
            .build();
        let now = Utc::now();
        saga.start(now).unwrap();
        for order in 0..3 {
            saga.start_step(order, now).unwrap();
            saga.complete_step(order, json!({}), now).unwrap();
        }
        saga.start_step(3, now).unwrap();
        saga.fail_step(3, "boom", now).unwrap();
        saga.fail("step d failed", now).unwrap();
        store.persist(&mut saga).await.unwrap();
        saga
    }

    #[tokio::test]
    async fn test_compensates_in_reverse_and_skips_missing_actions() {
        let executor = InMemoryStepExecutor::new();
        let (coordinator, store) = coordinator(&executor);
        let mut saga = failed_saga(&store).await;

        let report = coordinator.compensate(&mut saga).await.unwrap();

        assert_eq!(report.compensated, vec![2, 0]);
        assert_eq!(report.skipped, vec![1]);
        assert!(report.is_clean());
        assert_eq!(executor.compensation_calls(), vec!["UndoC", "UndoA"]);
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(saga.is_partially_compensated());

        let stored = store.load_required(saga.id()).await.unwrap();
        assert_eq!(stored.status(), SagaStatus::Compensated);
        assert_eq!(stored.steps()[2].status(), StepStatus::Compensated);
        assert_eq!(stored.steps()[1].status(), StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_compensation_continues_and_parks() {
        let executor = InMemoryStepExecutor::new();
        executor.set_outcome("svc", "UndoC", StepOutcome::transient("refund service down"));
        let (coordinator, store) = coordinator(&executor);
        let mut saga = failed_saga(&store).await;

        let report = coordinator.compensate(&mut saga).await.unwrap();

        assert_eq!(report.failed, vec![2]);
        assert_eq!(report.compensated, vec![0]);
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.parked(), Some(ParkReason::CompensationFailed));
        assert_eq!(saga.steps()[2].status(), StepStatus::CompensationFailed);
        assert_eq!(
            saga.steps()[2].compensation_error(),
            Some("refund service down")
        );
        // Not retried.
        assert_eq!(executor.call_count("UndoC"), 1);
    }

    #[tokio::test]
    async fn test_second_pass_touches_nothing_done() {
        let executor = InMemoryStepExecutor::new();
        executor.set_outcome("svc", "UndoC", StepOutcome::permanent("gone"));
        let (coordinator, store) = coordinator(&executor);
        let mut saga = failed_saga(&store).await;

        coordinator.compensate(&mut saga).await.unwrap();
        let report = coordinator.compensate(&mut saga).await.unwrap();

        assert!(report.compensated.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(executor.call_count("UndoA"), 1);
        assert_eq!(executor.call_count("UndoC"), 1);
        assert_eq!(saga.status(), SagaStatus::Compensating);
    }

    #[tokio::test]
    async fn test_compensated_saga_is_noop() {
        let executor = InMemoryStepExecutor::new();
        let (coordinator, store) = coordinator(&executor);
        let mut saga = failed_saga(&store).await;

        coordinator.compensate(&mut saga).await.unwrap();
        let calls = executor.calls().len();
        let report = coordinator.compensate(&mut saga).await.unwrap();

        assert_eq!(report, CompensationReport::default());
        assert_eq!(executor.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_resumes_interrupted_compensation() {
        let executor = InMemoryStepExecutor::new();
        let (coordinator, store) = coordinator(&executor);
        let mut saga = failed_saga(&store).await;

        // A previous worker started compensating step 2 and crashed.
        saga.start_step_compensation(2, Utc::now()).unwrap();
        store.persist(&mut saga).await.unwrap();

        let report = coordinator.compensate(&mut saga).await.unwrap();
        assert_eq!(report.compensated, vec![2, 0]);
        assert_eq!(saga.status(), SagaStatus::Compensated);
    }

    #[tokio::test]
    async fn test_stops_when_lease_is_lost() {
        let executor = InMemoryStepExecutor::new();
        let (coordinator, store) = coordinator(&executor);
        let mut saga = failed_saga(&store).await;
        store
            .try_acquire_lease(saga.id(), "other-worker", Duration::from_secs(60), Utc::now())
            .await
            .unwrap();

        let lease = LeaseKeeper::new(Arc::new(store.clone()), "w1", Duration::from_secs(60));
        let result = coordinator.with_lease(lease).compensate(&mut saga).await;

        assert!(matches!(result, Err(OrchestratorError::LeaseHeld(_))));
        assert!(executor.calls().is_empty());
        let stored = store.load_required(saga.id()).await.unwrap();
        assert_eq!(stored.steps()[2].status(), StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejects_running_saga() {
        let executor = InMemoryStepExecutor::new();
        let (coordinator, _store) = coordinator(&executor);
        let mut saga = Saga::new("T", "n", "c");
        saga.start(Utc::now()).unwrap();

        let result = coordinator.compensate(&mut saga).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Saga(SagaError::InvalidTransition { .. }))
        ));
    }
}
