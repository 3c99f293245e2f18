use saga::{SagaError, SagaStatus};
use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The saga was modified by someone else since it was loaded.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The saga was not found in the store.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// Only sagas in a terminal state can be archived.
    #[error("Saga {saga_id} is {status} and cannot be archived")]
    NotTerminal { saga_id: SagaId, status: SagaStatus },

    /// A stored row could not be turned back into a saga.
    #[error("Corrupt saga data: {0}")]
    Corrupt(#[from] SagaError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
