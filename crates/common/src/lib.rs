//! Shared types for the saga engine crates.

pub mod types;

pub use types::{SagaId, StepId, Version};
