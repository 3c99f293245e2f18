//! Saga orchestration engine.
//!
//! The [`Orchestrator`] drives each saga through its steps strictly in
//! order, dispatching actions through a [`StepExecutor`]. Transient failures
//! and timeouts are retried with exponential backoff; a step that fails for
//! good triggers compensation of the completed steps in reverse order.
//! Sagas whose compensation cannot finish are parked for an operator.
//!
//! The [`WorkerPool`] polls the saga store for runnable sagas and drives
//! them concurrently, one worker per saga.

pub mod compensation;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
mod lease;
pub mod memory;
pub mod orchestrator;
pub mod retry;
pub mod worker;

pub use compensation::{CompensationCoordinator, CompensationReport};
pub use config::OrchestratorConfig;
pub use definition::{DefinitionRegistry, InstanceDefaults, SagaDefinition, StepDefinition};
pub use error::{OrchestratorError, Result};
pub use events::{NotificationBus, SagaNotification};
pub use executor::{
    DispatchKind, Dispatcher, IdempotencyKey, StepExecutor, StepOutcome, StepRequest,
};
pub use memory::InMemoryStepExecutor;
pub use orchestrator::Orchestrator;
pub use retry::RetryPolicy;
pub use worker::WorkerPool;
