use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga::{Saga, SagaRecord};
use tokio::sync::RwLock;

use crate::store::{SagaStore, lease_expiry};
use crate::{Result, SagaId, StoreError, Version};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: SagaRecord,
    lease: Option<Lease>,
    archived: bool,
}

/// In-memory saga store for testing and single-process deployments.
///
/// Sagas are kept as persistence records and rebuilt on load, so the same
/// validation applies as with the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    entries: Arc<RwLock<HashMap<SagaId, Entry>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored, archived ones included.
    pub async fn saga_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true once the saga has been archived.
    pub async fn is_archived(&self, saga_id: SagaId) -> bool {
        self.entries
            .read()
            .await
            .get(&saga_id)
            .is_some_and(|entry| entry.archived)
    }

    /// Returns the current lease holder of a saga, if the lease is live.
    pub async fn lease_owner(&self, saga_id: SagaId, now: DateTime<Utc>) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&saga_id)
            .and_then(|entry| entry.lease.as_ref())
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.owner.clone())
    }

    /// Clears all sagas.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    fn rebuild<'a>(entries: impl Iterator<Item = &'a Entry>) -> Result<Vec<Saga>> {
        let mut sagas = entries
            .map(|entry| Saga::from_record(entry.record.clone()).map_err(StoreError::from))
            .collect::<Result<Vec<_>>>()?;
        sagas.sort_by_key(|saga| saga.created_at());
        Ok(sagas)
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, saga: &Saga) -> Result<Version> {
        let mut entries = self.entries.write().await;
        let saga_id = saga.id();
        let expected = saga.version();

        let actual = entries
            .get(&saga_id)
            .map(|entry| entry.record.version)
            .unwrap_or(Version::initial());

        if actual != expected {
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual,
            });
        }

        let next = expected.next();
        let mut record = saga.to_record();
        record.version = next;

        match entries.get_mut(&saga_id) {
            Some(entry) => entry.record = record,
            None => {
                entries.insert(
                    saga_id,
                    Entry {
                        record,
                        lease: None,
                        archived: false,
                    },
                );
            }
        }

        Ok(next)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        let entries = self.entries.read().await;
        match entries.get(&saga_id) {
            Some(entry) => Ok(Some(Saga::from_record(entry.record.clone())?)),
            None => Ok(None),
        }
    }

    async fn load_runnable(&self, now: DateTime<Utc>) -> Result<Vec<Saga>> {
        let entries = self.entries.read().await;
        let sagas = Self::rebuild(entries.values().filter(|entry| {
            !entry.archived
                && !entry.record.status.is_terminal()
                && entry.record.parked.is_none()
                && !entry.lease.as_ref().is_some_and(|lease| lease.is_live(now))
        }))?;
        Ok(sagas)
    }

    async fn load_parked(&self) -> Result<Vec<Saga>> {
        let entries = self.entries.read().await;
        Self::rebuild(
            entries
                .values()
                .filter(|entry| !entry.archived && entry.record.parked.is_some()),
        )
    }

    async fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        if let Some(lease) = &entry.lease
            && lease.owner != owner
            && lease.is_live(now)
        {
            return Ok(false);
        }

        entry.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: lease_expiry(now, ttl),
        });
        Ok(true)
    }

    async fn release_lease(&self, saga_id: SagaId, owner: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&saga_id)
            && entry.lease.as_ref().is_some_and(|lease| lease.owner == owner)
        {
            entry.lease = None;
        }
        Ok(())
    }

    async fn archive(&self, saga_id: SagaId) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        if !entry.record.status.is_terminal() {
            return Err(StoreError::NotTerminal {
                saga_id,
                status: entry.record.status,
            });
        }
        entry.archived = true;
        entry.lease = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaStoreExt;
    use saga::{ParkReason, SagaStatus, SagaStep};
    use serde_json::{Value, json};

    fn create_test_saga() -> Saga {
        Saga::builder("DealerOnboarding", "onboard", "corr-1")
            .step(
                SagaStep::new("create_dealer", "dealers", "CreateDealer", json!({}))
                    .with_compensation("DeleteDealer", Value::Null),
            )
            .step(SagaStep::new("charge", "payments", "Charge", json!({"cents": 100})))
            .build()
    }

    #[tokio::test]
    async fn save_and_load() {
        let store = InMemorySagaStore::new();
        let mut saga = create_test_saga();

        store.persist(&mut saga).await.unwrap();
        assert_eq!(saga.version(), Version::new(1));

        let loaded = store.load(saga.id()).await.unwrap().unwrap();
        assert_eq!(loaded.id(), saga.id());
        assert_eq!(loaded.version(), Version::new(1));
        assert_eq!(loaded.total_steps(), 2);
        assert_eq!(loaded.steps()[1].action_payload(), &json!({"cents": 100}));
    }

    #[tokio::test]
    async fn load_missing_saga() {
        let store = InMemorySagaStore::new();
        assert!(store.load(SagaId::new()).await.unwrap().is_none());
        assert!(matches!(
            store.load_required(SagaId::new()).await,
            Err(StoreError::SagaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrency_conflict_on_stale_version() {
        let store = InMemorySagaStore::new();
        let mut saga = create_test_saga();
        store.persist(&mut saga).await.unwrap();

        let mut first = store.load_required(saga.id()).await.unwrap();
        let mut second = store.load_required(saga.id()).await.unwrap();

        first.start(Utc::now()).unwrap();
        store.persist(&mut first).await.unwrap();

        second.start(Utc::now()).unwrap();
        let result = store.save(&second).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { expected, actual, .. })
                if expected == Version::new(1) && actual == Version::new(2)
        ));
    }

    #[tokio::test]
    async fn saving_a_new_saga_twice_conflicts() {
        let store = InMemorySagaStore::new();
        let saga = create_test_saga();
        store.save(&saga).await.unwrap();
        assert!(matches!(
            store.save(&saga).await,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn load_runnable_skips_terminal_parked_and_leased() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();

        let mut created = create_test_saga();
        store.persist(&mut created).await.unwrap();

        let mut completed = Saga::new("T", "done", "c");
        completed.start(now).unwrap();
        completed.complete(now).unwrap();
        store.persist(&mut completed).await.unwrap();

        let mut parked = create_test_saga();
        parked.start(now).unwrap();
        parked.fail("boom", now).unwrap();
        parked.park(ParkReason::CompensationFailed);
        store.persist(&mut parked).await.unwrap();

        let mut leased = create_test_saga();
        store.persist(&mut leased).await.unwrap();
        assert!(
            store
                .try_acquire_lease(leased.id(), "worker-a", Duration::from_secs(60), now)
                .await
                .unwrap()
        );

        let runnable = store.load_runnable(now).await.unwrap();
        let ids: Vec<SagaId> = runnable.iter().map(Saga::id).collect();
        assert_eq!(ids, vec![created.id()]);

        let parked_sagas = store.load_parked().await.unwrap();
        assert_eq!(parked_sagas.len(), 1);
        assert_eq!(parked_sagas[0].status(), SagaStatus::Compensating);

        // Once the lease runs out the saga is runnable again.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(store.load_runnable(later).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = InMemorySagaStore::new();
        let mut saga = create_test_saga();
        store.persist(&mut saga).await.unwrap();
        let now = Utc::now();
        let ttl = Duration::from_secs(10);

        assert!(store.try_acquire_lease(saga.id(), "a", ttl, now).await.unwrap());
        assert!(!store.try_acquire_lease(saga.id(), "b", ttl, now).await.unwrap());
        assert!(store.try_acquire_lease(saga.id(), "a", ttl, now).await.unwrap());
        assert_eq!(store.lease_owner(saga.id(), now).await.as_deref(), Some("a"));

        let expired = now + chrono::Duration::seconds(10);
        assert!(store.try_acquire_lease(saga.id(), "b", ttl, expired).await.unwrap());

        store.release_lease(saga.id(), "a").await.unwrap();
        assert_eq!(store.lease_owner(saga.id(), expired).await.as_deref(), Some("b"));

        store.release_lease(saga.id(), "b").await.unwrap();
        assert!(store.lease_owner(saga.id(), expired).await.is_none());
    }

    #[tokio::test]
    async fn lease_on_unknown_saga_fails() {
        let store = InMemorySagaStore::new();
        let result = store
            .try_acquire_lease(SagaId::new(), "a", Duration::from_secs(1), Utc::now())
            .await;
        assert!(matches!(result, Err(StoreError::SagaNotFound(_))));
    }

    #[tokio::test]
    async fn archive_requires_terminal_state() {
        let store = InMemorySagaStore::new();
        let now = Utc::now();
        let mut saga = Saga::new("T", "n", "c");
        store.persist(&mut saga).await.unwrap();

        assert!(matches!(
            store.archive(saga.id()).await,
            Err(StoreError::NotTerminal { status: SagaStatus::Created, .. })
        ));

        saga.start(now).unwrap();
        saga.complete(now).unwrap();
        store.persist(&mut saga).await.unwrap();
        assert!(!store.is_archived(saga.id()).await);
        store.archive(saga.id()).await.unwrap();

        assert!(store.is_archived(saga.id()).await);
        assert!(store.load(saga.id()).await.unwrap().is_some());
        assert!(store.load_runnable(now).await.unwrap().is_empty());
    }
}
