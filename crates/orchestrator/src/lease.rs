//! Single-owner access to sagas: store leases across processes and claims
//! within one process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use saga::SagaId;
use saga_store::SagaStore;

use crate::error::{OrchestratorError, Result};

/// Takes, extends and releases store leases for one worker.
#[derive(Clone)]
pub(crate) struct LeaseKeeper {
    store: Arc<dyn SagaStore>,
    owner: String,
    ttl: Duration,
}

impl LeaseKeeper {
    pub(crate) fn new(store: Arc<dyn SagaStore>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl,
        }
    }

    /// Takes or extends the lease so it outlives `hold`, and never for less
    /// than the configured TTL. Fails if another worker holds it.
    pub(crate) async fn renew(&self, saga_id: SagaId, hold: Duration) -> Result<()> {
        let ttl = self.ttl.max(hold);
        let acquired = self
            .store
            .try_acquire_lease(saga_id, &self.owner, ttl, Utc::now())
            .await?;
        if !acquired {
            return Err(OrchestratorError::LeaseHeld(saga_id));
        }
        Ok(())
    }

    pub(crate) async fn release(&self, saga_id: SagaId) {
        if let Err(err) = self.store.release_lease(saga_id, &self.owner).await {
            tracing::warn!(%saga_id, error = %err, "failed to release saga lease");
        }
    }
}

/// Sagas claimed by tasks of this process.
///
/// Tasks of one process share a lease owner, so the store lease alone does
/// not keep two of them off the same saga.
#[derive(Clone, Default)]
pub(crate) struct ClaimSet {
    claimed: Arc<Mutex<HashSet<SagaId>>>,
}

impl ClaimSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<SagaId>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims a saga, or returns None if another task holds it.
    pub(crate) fn claim(&self, saga_id: SagaId) -> Option<Claim> {
        if !self.lock().insert(saga_id) {
            return None;
        }
        Some(Claim {
            set: self.clone(),
            saga_id,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A claim on one saga, given back when dropped, including on panic.
pub(crate) struct Claim {
    set: ClaimSet,
    saga_id: SagaId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set.lock().remove(&self.saga_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga::Saga;
    use saga_store::{InMemorySagaStore, SagaStoreExt};

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let set = ClaimSet::default();
        let saga_id = SagaId::new();

        let claim = set.claim(saga_id).unwrap();
        assert!(set.claim(saga_id).is_none());
        assert!(set.claim(SagaId::new()).is_some());
        assert_eq!(set.len(), 1);

        drop(claim);
        assert_eq!(set.len(), 0);
        assert!(set.claim(saga_id).is_some());
    }

    #[tokio::test]
    async fn test_claim_is_released_when_task_panics() {
        let set = ClaimSet::default();
        let saga_id = SagaId::new();

        let claim = set.claim(saga_id).unwrap();
        let handle = tokio::spawn(async move {
            let _claim = claim;
            panic!("step executor blew up");
        });

        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(set.len(), 0);
        assert!(set.claim(saga_id).is_some());
    }

    #[tokio::test]
    async fn test_renew_holds_for_at_least_the_ttl() {
        let store = InMemorySagaStore::new();
        let mut saga = Saga::new("T", "n", "c");
        store.persist(&mut saga).await.unwrap();

        let keeper = LeaseKeeper::new(Arc::new(store.clone()), "w1", Duration::from_secs(10));
        keeper.renew(saga.id(), Duration::from_secs(1)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.lease_owner(saga.id(), later).await.as_deref(), Some("w1"));

        keeper.release(saga.id()).await;
        assert!(store.lease_owner(saga.id(), Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_renew_extends_for_long_holds() {
        let store = InMemorySagaStore::new();
        let mut saga = Saga::new("T", "n", "c");
        store.persist(&mut saga).await.unwrap();

        let keeper = LeaseKeeper::new(Arc::new(store.clone()), "w1", Duration::from_secs(10));
        keeper.renew(saga.id(), Duration::from_secs(120)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(store.lease_owner(saga.id(), later).await.as_deref(), Some("w1"));

        let other = LeaseKeeper::new(Arc::new(store.clone()), "w2", Duration::from_secs(10));
        assert!(matches!(
            other.renew(saga.id(), Duration::ZERO).await,
            Err(OrchestratorError::LeaseHeld(_))
        ));
    }
}
