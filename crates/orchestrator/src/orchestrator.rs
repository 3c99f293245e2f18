//! The saga control loop and operator commands.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use saga::{ParkReason, Saga, SagaError, SagaId, SagaStatus, StepStatus};
use saga_store::{SagaStore, SagaStoreExt};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::compensation::{CompensationCoordinator, CompensationReport};
use crate::config::OrchestratorConfig;
use crate::definition::DefinitionRegistry;
use crate::error::{OrchestratorError, Result};
use crate::events::{NotificationBus, SagaNotification};
use crate::executor::{Dispatcher, StepExecutor, StepOutcome};
use crate::lease::{ClaimSet, LeaseKeeper};
use crate::retry::RetryPolicy;

/// Drives sagas through their steps and compensation.
///
/// Every operation that changes a saga first claims it within this process
/// and takes its lease in the store, so one saga is only ever driven by one
/// worker at a time. The lease is renewed before every dispatch. The saga is
/// persisted after every transition; a worker that dies mid-saga leaves a
/// state another worker can resume from once the lease expires. Sagas that
/// reach a terminal state are archived.
pub struct Orchestrator {
    store: Arc<dyn SagaStore>,
    dispatcher: Dispatcher,
    compensation: CompensationCoordinator,
    definitions: DefinitionRegistry,
    notifications: NotificationBus,
    retry: RetryPolicy,
    lease: LeaseKeeper,
    claims: ClaimSet,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Fails with `InvalidConfig` when the configuration does not validate.
    pub fn new(
        store: Arc<dyn SagaStore>,
        executor: Arc<dyn StepExecutor>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(executor, config.step_timeout);
        let lease = LeaseKeeper::new(store.clone(), config.worker_id.clone(), config.lease_ttl);
        let compensation = CompensationCoordinator::new(store.clone(), dispatcher.clone())
            .with_lease(lease.clone());
        Ok(Self {
            store,
            dispatcher,
            compensation,
            definitions: DefinitionRegistry::new(),
            notifications: NotificationBus::default(),
            retry: config.retry_policy(),
            lease,
            claims: ClaimSet::default(),
            config,
        })
    }

    /// Uses an existing definition registry instead of an empty one.
    pub fn with_definitions(mut self, definitions: DefinitionRegistry) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Subscribes to saga outcome notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SagaNotification> {
        self.notifications.subscribe()
    }

    /// Creates and persists a `Created` saga from a registered definition.
    /// The saga runs when a worker picks it up or [`Orchestrator::run`] is called.
    #[tracing::instrument(skip(self, context))]
    pub async fn start_saga(
        &self,
        saga_type: &str,
        correlation_id: &str,
        context: BTreeMap<String, Value>,
    ) -> Result<Saga> {
        let definition = self
            .definitions
            .get(saga_type)
            .ok_or_else(|| OrchestratorError::UnknownDefinition(saga_type.to_string()))?;

        let saga = definition.instantiate(correlation_id, context, &self.config.instance_defaults());
        self.submit(saga).await
    }

    /// Persists a hand-built saga so it can be run.
    pub async fn submit(&self, mut saga: Saga) -> Result<Saga> {
        if saga.status() != SagaStatus::Created {
            return Err(OrchestratorError::InvalidRequest {
                saga_id: saga.id(),
                action: "submit",
                status: saga.status(),
            });
        }
        self.store.persist(&mut saga).await?;
        tracing::info!(saga_id = %saga.id(), saga_type = saga.saga_type(), steps = saga.total_steps(), "saga created");
        Ok(saga)
    }

    /// Drives a saga as far as it can go: to a terminal state, to a park, or
    /// until an error escapes.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, saga_id: SagaId) -> Result<Saga> {
        self.leased(saga_id, self.drive(saga_id)).await
    }

    /// Like [`Orchestrator::run`], but when the saga is already being driven
    /// elsewhere, waits up to `wait_timeout` for its outcome on `outcomes`
    /// and returns the saga as stored.
    ///
    /// Subscribe before the saga is persisted so no outcome slips by. Only
    /// this orchestrator's notifications arrive on `outcomes`; a saga driven by
    /// another process is returned as it stands once the wait runs out.
    #[tracing::instrument(skip(self, outcomes))]
    pub async fn run_or_await(
        &self,
        saga_id: SagaId,
        mut outcomes: broadcast::Receiver<SagaNotification>,
    ) -> Result<Saga> {
        match self.run(saga_id).await {
            Err(OrchestratorError::LeaseHeld(_)) => {}
            result => return result,
        }

        tracing::debug!(%saga_id, "saga driven by another worker, waiting for its outcome");
        let waited = tokio::time::timeout(self.config.wait_timeout, async {
            loop {
                match outcomes.recv().await {
                    Ok(notification) if notification.saga_id() == saga_id => return,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // The outcome may have been among the dropped messages.
                        if let Ok(Some(saga)) = self.store.load(saga_id).await
                            && !saga.is_runnable()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
        .await;
        if waited.is_err() {
            tracing::debug!(%saga_id, "no outcome before the wait ran out");
        }
        self.get(saga_id).await
    }

    /// Cancels a `Created` or `Running` saga and compensates its completed steps.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, saga_id: SagaId) -> Result<Saga> {
        self.leased(saga_id, async {
            let mut saga = self.store.load_required(saga_id).await?;
            if !saga.status().can_fail() {
                return Err(OrchestratorError::InvalidRequest {
                    saga_id,
                    action: "cancel",
                    status: saga.status(),
                });
            }

            self.abort(&mut saga, "cancelled", Utc::now())?;
            self.store.persist(&mut saga).await?;
            tracing::info!(%saga_id, "saga cancelled");

            self.compensate(&mut saga).await?;
            Ok(saga)
        })
        .await
    }

    /// Reopens failed compensations of a parked saga and compensates again.
    ///
    /// Calling it on a saga that is already `Compensated` does nothing.
    #[tracing::instrument(skip(self))]
    pub async fn resume_compensation(&self, saga_id: SagaId) -> Result<Saga> {
        self.leased(saga_id, async {
            let mut saga = self.store.load_required(saga_id).await?;
            match saga.status() {
                SagaStatus::Compensated => return Ok(saga),
                SagaStatus::Compensating => {}
                status => {
                    return Err(OrchestratorError::InvalidRequest {
                        saga_id,
                        action: "resume compensation of",
                        status,
                    });
                }
            }

            let reopened = saga.reopen_failed_compensations()?;
            saga.unpark();
            self.store.persist(&mut saga).await?;
            tracing::info!(%saga_id, reopened, "compensation resumed by operator");

            self.compensate(&mut saga).await?;
            Ok(saga)
        })
        .await
    }

    /// Gives up on a parked, `Compensating` saga: it becomes `Failed` with
    /// whatever compensation is still outstanding.
    #[tracing::instrument(skip(self))]
    pub async fn abandon(&self, saga_id: SagaId) -> Result<Saga> {
        self.leased(saga_id, async {
            let mut saga = self.store.load_required(saga_id).await?;
            if saga.status() != SagaStatus::Compensating {
                return Err(OrchestratorError::InvalidRequest {
                    saga_id,
                    action: "abandon",
                    status: saga.status(),
                });
            }
            if !saga.is_parked() {
                return Err(OrchestratorError::NotParked(saga_id));
            }

            saga.mark_failed(Utc::now())?;
            self.store.persist(&mut saga).await?;
            tracing::warn!(%saga_id, failed_steps = ?saga.failed_compensations(), "saga abandoned by operator");
            self.notifications.publish(SagaNotification::failed(&saga));
            self.archive(&saga).await;
            Ok(saga)
        })
        .await
    }

    pub async fn get(&self, saga_id: SagaId) -> Result<Saga> {
        Ok(self.store.load_required(saga_id).await?)
    }

    /// Returns the parked sagas waiting for an operator.
    pub async fn requiring_attention(&self) -> Result<Vec<Saga>> {
        Ok(self.store.load_parked().await?)
    }

    /// Runs `work` while holding the saga's claim and lease.
    async fn leased<T>(&self, saga_id: SagaId, work: impl Future<Output = Result<T>>) -> Result<T> {
        let Some(_claim) = self.claims.claim(saga_id) else {
            return Err(OrchestratorError::LeaseHeld(saga_id));
        };
        self.lease.renew(saga_id, Duration::ZERO).await?;
        let result = work.await;
        self.lease.release(saga_id).await;
        result
    }

    /// Moves a saga that reached a terminal state out of the active set.
    async fn archive(&self, saga: &Saga) {
        let saga_id = saga.id();
        match self.store.archive(saga_id).await {
            Ok(()) => tracing::debug!(%saga_id, status = %saga.status(), "saga archived"),
            Err(err) => tracing::warn!(%saga_id, error = %err, "failed to archive saga"),
        }
    }

    async fn drive(&self, saga_id: SagaId) -> Result<Saga> {
        let mut saga = self.store.load_required(saga_id).await?;
        if !saga.is_runnable() {
            tracing::debug!(%saga_id, status = %saga.status(), parked = ?saga.parked(), "saga not runnable");
            return Ok(saga);
        }

        metrics::counter!("saga_runs_total").increment(1);

        if saga.status() == SagaStatus::Created {
            saga.start(Utc::now())?;
            self.store.persist(&mut saga).await?;
            tracing::info!(%saga_id, saga_type = saga.saga_type(), "saga started");
        }

        if saga.status() == SagaStatus::Running {
            self.execute_steps(&mut saga).await?;
        }

        if saga.status() == SagaStatus::Completed {
            metrics::counter!("saga_completed_total").increment(1);
            record_duration(&saga);
            tracing::info!(%saga_id, "saga completed");
            self.notifications.publish(SagaNotification::completed(&saga));
            self.archive(&saga).await;
        } else if saga.status() == SagaStatus::Compensating {
            self.compensate(&mut saga).await?;
        }

        Ok(saga)
    }

    /// Runs pending steps in order until the saga leaves `Running`.
    async fn execute_steps(&self, saga: &mut Saga) -> Result<()> {
        while saga.status() == SagaStatus::Running {
            let now = Utc::now();
            if saga.has_timed_out(now) {
                tracing::warn!(saga_id = %saga.id(), "saga timed out");
                self.abort(saga, "saga timeout", now)?;
                self.store.persist(saga).await?;
                return Ok(());
            }

            let order = if let Some(step) = saga.in_flight_step() {
                // A previous worker dispatched this step and never recorded the outcome.
                let order = step.order();
                let window_elapsed = step.has_timed_out(now);
                if !saga.record_recovery_attempt() {
                    return self
                        .escalate(saga, format!("recovery attempts exhausted at step {order}"))
                        .await;
                }
                self.store.persist(saga).await?;

                if window_elapsed {
                    metrics::counter!("saga_step_timeouts_total").increment(1);
                    tracing::warn!(saga_id = %saga.id(), order, attempt = saga.current_retry_attempt(), "interrupted step outlived its timeout, counting a timed out attempt");
                    if !self
                        .retry_step(saga, order, "step timed out".to_string(), now)
                        .await?
                    {
                        continue;
                    }
                } else {
                    tracing::warn!(saga_id = %saga.id(), order, attempt = saga.current_retry_attempt(), "re-dispatching interrupted step");
                }
                order
            } else if let Some(step) = saga.get_next_step() {
                let order = step.order();
                if let Some(blocking) = saga.steps()[..order as usize]
                    .iter()
                    .find(|earlier| earlier.status() != StepStatus::Completed)
                {
                    let reason = format!(
                        "step {order} is next but step {} is {}",
                        blocking.order(),
                        blocking.status()
                    );
                    return self.escalate(saga, reason).await;
                }
                saga.start_step(order, now)?;
                self.store.persist(saga).await?;
                tracing::info!(saga_id = %saga.id(), order, step = saga.steps()[order as usize].name(), "saga step started");
                order
            } else if saga.all_steps_completed() {
                saga.complete(now)?;
                self.store.persist(saga).await?;
                return Ok(());
            } else {
                return self
                    .escalate(saga, "no pending step but not all steps completed".to_string())
                    .await;
            };

            self.run_step(saga, order).await?;
        }
        Ok(())
    }

    /// Dispatches one `Running` step until it completes, fails for good, or
    /// the saga times out.
    async fn run_step(&self, saga: &mut Saga, order: u32) -> Result<()> {
        loop {
            let outcome = {
                let step = saga.step(order).ok_or(SagaError::StepNotFound(order))?;
                let hold = self
                    .dispatcher
                    .timeout_for(step)
                    .saturating_add(self.config.backoff_cap);
                self.lease.renew(saga.id(), hold).await?;
                self.dispatcher.dispatch_action(saga, step).await
            };

            let now = Utc::now();
            let message = match outcome {
                StepOutcome::Success(response) => {
                    saga.complete_step(order, response, now)?;
                    self.store.persist(saga).await?;
                    tracing::info!(saga_id = %saga.id(), order, "saga step completed");
                    return Ok(());
                }
                StepOutcome::Failure {
                    message,
                    permanent: true,
                } => {
                    return self.fail_step(saga, order, message, now).await;
                }
                StepOutcome::Failure { message, .. } => message,
                StepOutcome::Timeout => "step timed out".to_string(),
            };

            if !self.retry_step(saga, order, message, now).await? {
                return Ok(());
            }
        }
    }

    /// Counts a failed attempt of a `Running` step and waits out the backoff.
    ///
    /// Returns false when the step has no retries left and failed, or when
    /// the saga timed out during the backoff.
    async fn retry_step(
        &self,
        saga: &mut Saga,
        order: u32,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let step = saga.step(order).ok_or(SagaError::StepNotFound(order))?;
        if !step.can_retry() {
            self.fail_step(saga, order, message, now).await?;
            return Ok(false);
        }

        let attempt = saga.increment_step_retry(order)?;
        self.store.persist(saga).await?;
        metrics::counter!("saga_step_retries_total").increment(1);

        let delay = self.retry.backoff(attempt);
        tracing::info!(saga_id = %saga.id(), order, attempt, delay_ms = delay.as_millis() as u64, error = %message, "retrying saga step");
        tokio::time::sleep(delay).await;

        let now = Utc::now();
        if saga.has_timed_out(now) {
            tracing::warn!(saga_id = %saga.id(), order, "saga timed out while retrying");
            self.abort(saga, "saga timeout", now)?;
            self.store.persist(saga).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn fail_step(
        &self,
        saga: &mut Saga,
        order: u32,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let name = saga
            .step(order)
            .map(|step| step.name().to_string())
            .unwrap_or_default();
        saga.fail_step(order, &message, now)?;
        saga.fail(format!("step '{name}' failed: {message}"), now)?;
        self.store.persist(saga).await?;
        tracing::warn!(saga_id = %saga.id(), order, step = %name, error = %message, "saga step failed, compensating");
        Ok(())
    }

    /// Fails the saga, and its in-flight step if any, without dispatching anything.
    fn abort(&self, saga: &mut Saga, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(order) = saga.in_flight_step().map(|step| step.order()) {
            saga.fail_step(order, reason, now)?;
        }
        saga.fail(reason, now)?;
        Ok(())
    }

    /// Parks a saga that broke a structural invariant and reports it.
    async fn escalate(&self, saga: &mut Saga, reason: String) -> Result<()> {
        let saga_id = saga.id();
        tracing::error!(%saga_id, %reason, "saga invariant violated");

        if saga.status().can_fail() {
            self.abort(saga, &reason, Utc::now())?;
        }
        saga.park(ParkReason::InvariantViolation);
        self.store.persist(saga).await?;

        metrics::counter!("saga_parked_total").increment(1);
        if let Some(notification) = SagaNotification::parked(saga) {
            self.notifications.publish(notification);
        }
        Err(OrchestratorError::InvariantViolation { saga_id, reason })
    }

    async fn compensate(&self, saga: &mut Saga) -> Result<CompensationReport> {
        let report = self.compensation.compensate(saga).await?;

        if saga.status() == SagaStatus::Compensated {
            record_duration(saga);
            self.notifications.publish(SagaNotification::compensated(saga));
            self.archive(saga).await;
        } else if let Some(notification) = SagaNotification::parked(saga) {
            self.notifications.publish(notification);
        }
        Ok(report)
    }
}

fn record_duration(saga: &Saga) {
    if let Some(started_at) = saga.started_at()
        && let Ok(elapsed) = (Utc::now() - started_at).to_std()
    {
        metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
    }
}
