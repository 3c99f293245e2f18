//! Step dispatch contract and the timeout-bounded dispatcher.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use saga::{Saga, SagaId, SagaStep, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key a service uses to recognise a repeated delivery of the same request.
///
/// Forward actions are keyed by retry attempt, so a retry after a failure is
/// a new request while a re-delivery after a crash is not. A compensation has
/// a single key per step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn forward(saga_id: SagaId, step_id: StepId, retry_attempts: u32) -> Self {
        Self(format!("{saga_id}:{step_id}:{retry_attempts}"))
    }

    pub fn compensation(saga_id: SagaId, step_id: StepId) -> Self {
        Self(format!("{saga_id}:{step_id}:compensate"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a request runs a step's action or undoes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchKind {
    Action,
    Compensation,
}

/// Everything a remote service needs to perform one step action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub saga_id: SagaId,
    pub step_id: StepId,
    pub step_name: String,
    pub order: u32,
    pub correlation_id: String,
    pub service_name: String,
    pub action_type: String,
    pub payload: Value,
    /// Snapshot of the saga context at dispatch time.
    pub context: BTreeMap<String, Value>,
    pub idempotency_key: IdempotencyKey,
    pub kind: DispatchKind,
}

impl StepRequest {
    /// Builds the forward request for a step.
    pub fn action(saga: &Saga, step: &SagaStep) -> Self {
        Self {
            saga_id: saga.id(),
            step_id: step.id(),
            step_name: step.name().to_string(),
            order: step.order(),
            correlation_id: saga.correlation_id().to_string(),
            service_name: step.service_name().to_string(),
            action_type: step.action_type().to_string(),
            payload: step.action_payload().clone(),
            context: saga.context().clone(),
            idempotency_key: IdempotencyKey::forward(saga.id(), step.id(), step.retry_attempts()),
            kind: DispatchKind::Action,
        }
    }

    /// Builds the compensation request for a step, if it has one.
    pub fn compensation(saga: &Saga, step: &SagaStep) -> Option<Self> {
        let action_type = step.compensation_action_type().filter(|a| !a.is_empty())?;
        Some(Self {
            saga_id: saga.id(),
            step_id: step.id(),
            step_name: step.name().to_string(),
            order: step.order(),
            correlation_id: saga.correlation_id().to_string(),
            service_name: step.service_name().to_string(),
            action_type: action_type.to_string(),
            payload: step.compensation_payload().clone(),
            context: saga.context().clone(),
            idempotency_key: IdempotencyKey::compensation(saga.id(), step.id()),
            kind: DispatchKind::Compensation,
        })
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The service performed the action and answered with this payload.
    Success(Value),
    /// The service reported an error. Permanent failures are never retried.
    Failure { message: String, permanent: bool },
    /// No answer arrived in time.
    Timeout,
}

impl StepOutcome {
    pub fn transient(message: impl Into<String>) -> Self {
        StepOutcome::Failure {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepOutcome::Failure {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }
}

/// Trait for delivering step actions to the services that perform them.
///
/// Implementations own the transport. They must honour the idempotency key:
/// a repeated key returns the original result without repeating the effect.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn dispatch(&self, request: StepRequest) -> StepOutcome;
}

/// Sends step requests through a [`StepExecutor`] with a deadline.
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn StepExecutor>,
    default_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher. `default_timeout` bounds steps without a timeout of their own.
    pub fn new(executor: Arc<dyn StepExecutor>, default_timeout: Duration) -> Self {
        Self {
            executor,
            default_timeout,
        }
    }

    /// How long one dispatch of `step` may take.
    pub fn timeout_for(&self, step: &SagaStep) -> Duration {
        step.timeout().unwrap_or(self.default_timeout)
    }

    /// Dispatches a step's forward action.
    pub async fn dispatch_action(&self, saga: &Saga, step: &SagaStep) -> StepOutcome {
        let request = StepRequest::action(saga, step);
        self.dispatch_bounded(request, self.timeout_for(step)).await
    }

    /// Dispatches a step's compensating action. Steps without one succeed trivially.
    pub async fn dispatch_compensation(&self, saga: &Saga, step: &SagaStep) -> StepOutcome {
        match StepRequest::compensation(saga, step) {
            Some(request) => self.dispatch_bounded(request, self.timeout_for(step)).await,
            None => StepOutcome::Success(Value::Null),
        }
    }

    async fn dispatch_bounded(&self, request: StepRequest, timeout: Duration) -> StepOutcome {
        let saga_id = request.saga_id;
        let order = request.order;
        let kind = request.kind;
        let action = request.action_type.clone();
        let key = request.idempotency_key.clone();

        tracing::debug!(%saga_id, order, %action, %key, ?kind, "dispatching step");

        let outcome = match tokio::time::timeout(timeout, self.executor.dispatch(request)).await {
            Ok(outcome) => outcome,
            Err(_) => StepOutcome::Timeout,
        };

        match &outcome {
            StepOutcome::Success(_) => {}
            StepOutcome::Failure { message, permanent } => {
                tracing::warn!(%saga_id, order, %action, ?kind, permanent, error = %message, "step dispatch failed");
            }
            StepOutcome::Timeout => {
                metrics::counter!("saga_step_timeouts_total").increment(1);
                tracing::warn!(%saga_id, order, %action, ?kind, timeout_ms = timeout.as_millis() as u64, "step dispatch timed out");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowExecutor(Duration);

    #[async_trait]
    impl StepExecutor for SlowExecutor {
        async fn dispatch(&self, _request: StepRequest) -> StepOutcome {
            tokio::time::sleep(self.0).await;
            StepOutcome::Success(json!({"late": true}))
        }
    }

    fn saga_with_step(step: SagaStep) -> Saga {
        Saga::builder("T", "test", "corr-9").step(step).build()
    }

    #[test]
    fn test_idempotency_key_formats() {
        let saga_id = SagaId::new();
        let step_id = StepId::new();
        assert_eq!(
            IdempotencyKey::forward(saga_id, step_id, 2).as_str(),
            format!("{saga_id}:{step_id}:2")
        );
        assert_eq!(
            IdempotencyKey::compensation(saga_id, step_id).to_string(),
            format!("{saga_id}:{step_id}:compensate")
        );
    }

    #[test]
    fn test_action_request_carries_context_and_key() {
        let mut saga = saga_with_step(SagaStep::new("charge", "payments", "Charge", json!({"cents": 5})));
        saga.set_context_value("dealer_id", json!("D-1"));
        let step = &saga.steps()[0];

        let request = StepRequest::action(&saga, step);
        assert_eq!(request.service_name, "payments");
        assert_eq!(request.action_type, "Charge");
        assert_eq!(request.correlation_id, "corr-9");
        assert_eq!(request.context["dealer_id"], json!("D-1"));
        assert_eq!(request.kind, DispatchKind::Action);
        assert_eq!(
            request.idempotency_key,
            IdempotencyKey::forward(saga.id(), step.id(), 0)
        );
    }

    #[test]
    fn test_compensation_request_requires_action() {
        let saga = saga_with_step(SagaStep::new("notify", "mail", "Send", Value::Null));
        assert!(StepRequest::compensation(&saga, &saga.steps()[0]).is_none());

        let saga = saga_with_step(
            SagaStep::new("charge", "payments", "Charge", Value::Null)
                .with_compensation("Refund", json!({"full": true})),
        );
        let request = StepRequest::compensation(&saga, &saga.steps()[0]).unwrap();
        assert_eq!(request.action_type, "Refund");
        assert_eq!(request.payload, json!({"full": true}));
        assert_eq!(request.kind, DispatchKind::Compensation);
    }

    #[tokio::test]
    async fn test_dispatch_times_out() {
        let dispatcher = Dispatcher::new(
            Arc::new(SlowExecutor(Duration::from_millis(200))),
            Duration::from_secs(5),
        );
        let saga = saga_with_step(
            SagaStep::new("slow", "svc", "Slow", Value::Null).with_timeout(Duration::from_millis(10)),
        );
        let outcome = dispatcher.dispatch_action(&saga, &saga.steps()[0]).await;
        assert_eq!(outcome, StepOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_dispatch_within_deadline() {
        let dispatcher = Dispatcher::new(
            Arc::new(SlowExecutor(Duration::from_millis(1))),
            Duration::from_secs(5),
        );
        let saga = saga_with_step(SagaStep::new("quick", "svc", "Quick", Value::Null));
        let outcome = dispatcher.dispatch_action(&saga, &saga.steps()[0]).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_compensation_without_action_is_noop_success() {
        let dispatcher = Dispatcher::new(
            Arc::new(SlowExecutor(Duration::from_secs(10))),
            Duration::from_millis(1),
        );
        let saga = saga_with_step(SagaStep::new("notify", "mail", "Send", Value::Null));
        let outcome = dispatcher.dispatch_compensation(&saga, &saga.steps()[0]).await;
        assert_eq!(outcome, StepOutcome::Success(Value::Null));
    }
}
