//! Durable storage for sagas and their steps.
//!
//! The [`SagaStore`] trait is the only shared mutable resource of the engine.
//! Every state transition goes through load → mutate → save, guarded by a
//! per-saga lease and an optimistic version check.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::{SagaId, Version};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{SagaStore, SagaStoreExt, lease_expiry};
