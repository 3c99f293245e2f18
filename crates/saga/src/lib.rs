//! Saga and saga-step state machines.
//!
//! A saga is an ordered list of steps that together form one business
//! transaction across independent services. Steps run strictly in order;
//! if one fails for good, the completed steps are undone in reverse order
//! through their compensating actions.
//!
//! This crate holds the domain model only. Driving sagas lives in the
//! `orchestrator` crate and persistence in `saga-store`.

pub mod aggregate;
pub mod error;
pub mod record;
pub mod state;
pub mod step;

pub use aggregate::{DEFAULT_MAX_RETRY_ATTEMPTS, Saga, SagaBuilder};
pub use common::{SagaId, StepId, Version};
pub use error::{Result, SagaError};
pub use record::{SagaRecord, StepRecord};
pub use state::{ParkReason, SagaStatus, StepStatus};
pub use step::{DEFAULT_MAX_RETRIES, SagaStep};
