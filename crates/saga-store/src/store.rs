use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga::Saga;

use crate::{Result, SagaId, StoreError, Version};

/// Core trait for saga store implementations.
///
/// A saga and its steps are always saved and loaded together. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persists the saga and all of its steps atomically.
    ///
    /// The stored version must equal `saga.version()`; a saga that was never
    /// saved is at [`Version::initial`]. On mismatch the save fails with
    /// `ConcurrencyConflict` and nothing is written.
    ///
    /// Returns the new version of the saga.
    async fn save(&self, saga: &Saga) -> Result<Version>;

    /// Loads a saga with its steps. Archived sagas are still loadable.
    ///
    /// Returns None if the saga doesn't exist.
    async fn load(&self, saga_id: SagaId) -> Result<Option<Saga>>;

    /// Loads the sagas that need a worker: not terminal, not parked, not
    /// archived, and not leased by a live owner at `now`.
    ///
    /// Sagas are returned oldest first.
    async fn load_runnable(&self, now: DateTime<Utc>) -> Result<Vec<Saga>>;

    /// Loads the sagas waiting for operator action.
    async fn load_parked(&self) -> Result<Vec<Saga>>;

    /// Takes or renews the single-owner lease on a saga.
    ///
    /// Succeeds when the saga has no lease, when its lease expired at or
    /// before `now`, or when `owner` already holds it.
    async fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops the lease if `owner` holds it. Releasing a lease held by someone
    /// else is a no-op.
    async fn release_lease(&self, saga_id: SagaId, owner: &str) -> Result<()>;

    /// Moves a terminal saga out of the active set.
    async fn archive(&self, saga_id: SagaId) -> Result<()>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Saves the saga and records the new version on it.
    async fn persist(&self, saga: &mut Saga) -> Result<()> {
        let version = self.save(saga).await?;
        saga.set_version(version);
        Ok(())
    }

    /// Loads a saga that is expected to exist.
    async fn load_required(&self, saga_id: SagaId) -> Result<Saga> {
        self.load(saga_id)
            .await?
            .ok_or(StoreError::SagaNotFound(saga_id))
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Returns the instant a lease taken at `now` for `ttl` runs out.
pub fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry_adds_ttl() {
        let now = Utc::now();
        assert_eq!(
            lease_expiry(now, Duration::from_secs(30)),
            now + chrono::Duration::seconds(30)
        );
    }

    #[test]
    fn lease_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(lease_expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
