//! Scriptable in-memory step executor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::executor::{DispatchKind, IdempotencyKey, StepExecutor, StepOutcome, StepRequest};

#[derive(Debug, Default)]
struct ExecutorState {
    queued: HashMap<(String, String), VecDeque<StepOutcome>>,
    fixed: HashMap<(String, String), StepOutcome>,
    latency: HashMap<(String, String), Duration>,
    calls: Vec<StepRequest>,
    completed: HashMap<IdempotencyKey, StepOutcome>,
    effects: HashSet<IdempotencyKey>,
}

/// In-memory step executor for testing and the demo server.
///
/// Outcomes are scripted per `(service, action)`: queued outcomes are used
/// once each, in order, then the fixed outcome, then `Success(null)`.
/// Successful keys are remembered, so a repeated idempotency key returns the
/// original result without running the script again.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStepExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl InMemoryStepExecutor {
    /// Creates an executor where every action succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues outcomes used once each by the next calls to `service`/`action`.
    pub fn enqueue(
        &self,
        service: &str,
        action: &str,
        outcomes: impl IntoIterator<Item = StepOutcome>,
    ) {
        self.state()
            .queued
            .entry(key(service, action))
            .or_default()
            .extend(outcomes);
    }

    /// Sets the outcome for `service`/`action` once its queue is drained.
    pub fn set_outcome(&self, service: &str, action: &str, outcome: StepOutcome) {
        self.state().fixed.insert(key(service, action), outcome);
    }

    /// Delays every answer for `service`/`action`.
    pub fn set_latency(&self, service: &str, action: &str, latency: Duration) {
        self.state().latency.insert(key(service, action), latency);
    }

    /// Returns every request received, repeated deliveries included.
    pub fn calls(&self) -> Vec<StepRequest> {
        self.state().calls.clone()
    }

    /// Returns how many requests named `action` were received.
    pub fn call_count(&self, action: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.action_type == action)
            .count()
    }

    /// Returns the action types of compensation requests, in arrival order.
    pub fn compensation_calls(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind == DispatchKind::Compensation)
            .map(|call| call.action_type.clone())
            .collect()
    }

    /// Returns the number of distinct requests that took effect.
    pub fn effect_count(&self) -> usize {
        self.state().effects.len()
    }

    /// Marks a request as already performed, as if an earlier delivery had succeeded.
    pub fn record_completed(&self, key: IdempotencyKey, response: Value) {
        let mut state = self.state();
        state.effects.insert(key.clone());
        state.completed.insert(key, StepOutcome::Success(response));
    }

    /// Forgets all scripts, calls and remembered keys.
    pub fn clear(&self) {
        *self.state() = ExecutorState::default();
    }
}

fn key(service: &str, action: &str) -> (String, String) {
    (service.to_string(), action.to_string())
}

#[async_trait]
impl StepExecutor for InMemoryStepExecutor {
    async fn dispatch(&self, request: StepRequest) -> StepOutcome {
        let script_key = key(&request.service_name, &request.action_type);
        let latency = self.state().latency.get(&script_key).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.calls.push(request.clone());

        if let Some(previous) = state.completed.get(&request.idempotency_key) {
            return previous.clone();
        }

        let outcome = state
            .queued
            .get_mut(&script_key)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.fixed.get(&script_key).cloned())
            .unwrap_or(StepOutcome::Success(Value::Null));

        if outcome.is_success() {
            state.effects.insert(request.idempotency_key.clone());
            state
                .completed
                .insert(request.idempotency_key, outcome.clone());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga::{Saga, SagaStep};
    use serde_json::json;

    fn request_for(action: &str) -> StepRequest {
        let saga = Saga::builder("T", "n", "c")
            .step(SagaStep::new("s", "svc", action, Value::Null))
            .build();
        StepRequest::action(&saga, &saga.steps()[0])
    }

    #[tokio::test]
    async fn test_defaults_to_success() {
        let executor = InMemoryStepExecutor::new();
        let outcome = executor.dispatch(request_for("Do")).await;
        assert_eq!(outcome, StepOutcome::Success(Value::Null));
        assert_eq!(executor.call_count("Do"), 1);
        assert_eq!(executor.effect_count(), 1);
    }

    #[tokio::test]
    async fn test_queued_outcomes_then_fixed() {
        let executor = InMemoryStepExecutor::new();
        executor.enqueue("svc", "Do", [StepOutcome::transient("busy")]);
        executor.set_outcome("svc", "Do", StepOutcome::Success(json!({"ok": 1})));

        assert_eq!(
            executor.dispatch(request_for("Do")).await,
            StepOutcome::transient("busy")
        );
        assert_eq!(
            executor.dispatch(request_for("Do")).await,
            StepOutcome::Success(json!({"ok": 1}))
        );
    }

    #[tokio::test]
    async fn test_repeated_key_is_deduplicated() {
        let executor = InMemoryStepExecutor::new();
        executor.enqueue(
            "svc",
            "Do",
            [
                StepOutcome::Success(json!({"n": 1})),
                StepOutcome::Success(json!({"n": 2})),
            ],
        );
        let request = request_for("Do");

        let first = executor.dispatch(request.clone()).await;
        let second = executor.dispatch(request).await;
        assert_eq!(first, second);
        assert_eq!(executor.call_count("Do"), 2);
        assert_eq!(executor.effect_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_remembered() {
        let executor = InMemoryStepExecutor::new();
        executor.enqueue("svc", "Do", [StepOutcome::transient("down")]);
        let request = request_for("Do");

        assert!(!executor.dispatch(request.clone()).await.is_success());
        assert!(executor.dispatch(request).await.is_success());
        assert_eq!(executor.effect_count(), 1);
    }

    #[tokio::test]
    async fn test_record_completed_short_circuits() {
        let executor = InMemoryStepExecutor::new();
        executor.set_outcome("svc", "Do", StepOutcome::permanent("never"));
        let request = request_for("Do");
        executor.record_completed(request.idempotency_key.clone(), json!({"done": true}));

        assert_eq!(
            executor.dispatch(request).await,
            StepOutcome::Success(json!({"done": true}))
        );
    }
}
