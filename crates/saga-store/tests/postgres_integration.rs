//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use saga::{ParkReason, Saga, SagaStatus, SagaStep, StepStatus};
use saga_store::{PostgresSagaStore, SagaId, SagaStore, SagaStoreExt, StoreError, Version};
use serde_json::{Value, json};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_steps, sagas")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn create_test_saga() -> Saga {
    Saga::builder("DealerOnboarding", "onboard", "corr-1")
        .description("dealer onboarding")
        .timeout(Duration::from_secs(300))
        .step(
            SagaStep::new("create_dealer", "dealers", "CreateDealer", json!({"name": "Acme"}))
                .with_compensation("DeleteDealer", json!({"soft": true}))
                .with_timeout(Duration::from_secs(5)),
        )
        .step(SagaStep::new("charge", "payments", "Charge", json!({"cents": 100})).with_max_retries(5))
        .build()
}

#[tokio::test]
#[serial]
async fn save_and_load_round_trips_saga_and_steps() {
    let store = get_test_store().await;
    let mut saga = create_test_saga();

    store.persist(&mut saga).await.unwrap();
    assert_eq!(saga.version(), Version::new(1));

    let loaded = store.load_required(saga.id()).await.unwrap();
    assert_eq!(loaded.id(), saga.id());
    assert_eq!(loaded.status(), SagaStatus::Created);
    assert_eq!(loaded.description(), "dealer onboarding");
    assert_eq!(loaded.timeout(), Some(Duration::from_secs(300)));
    assert_eq!(loaded.total_steps(), 2);
    assert_eq!(loaded.steps()[0].timeout(), Some(Duration::from_secs(5)));
    assert_eq!(loaded.steps()[0].compensation_payload(), &json!({"soft": true}));
    assert_eq!(loaded.steps()[1].max_retries(), 5);
    assert_eq!(loaded.version(), Version::new(1));
}

#[tokio::test]
#[serial]
async fn progress_is_persisted() {
    let store = get_test_store().await;
    let mut saga = create_test_saga();
    store.persist(&mut saga).await.unwrap();

    let now = Utc::now();
    saga.start(now).unwrap();
    saga.start_step(0, now).unwrap();
    saga.complete_step(0, json!({"dealer_id": "D-9"}), now).unwrap();
    store.persist(&mut saga).await.unwrap();

    let loaded = store.load_required(saga.id()).await.unwrap();
    assert_eq!(loaded.status(), SagaStatus::Running);
    assert_eq!(loaded.current_step_index(), 1);
    assert_eq!(loaded.context()["dealer_id"], json!("D-9"));
    assert_eq!(loaded.steps()[0].status(), StepStatus::Completed);
    assert_eq!(
        loaded.steps()[0].response_payload(),
        Some(&json!({"dealer_id": "D-9"}))
    );
    assert_eq!(loaded.version(), Version::new(2));
}

#[tokio::test]
#[serial]
async fn stale_save_is_rejected() {
    let store = get_test_store().await;
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
#[serial]
async fn duplicate_insert_is_rejected() {
    let store = get_test_store().await;
    let saga = create_test_saga();
    store.save(&saga).await.unwrap();

    assert!(matches!(
        store.save(&saga).await,
        Err(StoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
#[serial]
async fn runnable_and_parked_queries() {
    let store = get_test_store().await;
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

    let runnable = store.load_runnable(now).await.unwrap();
    let ids: Vec<SagaId> = runnable.iter().map(Saga::id).collect();
    assert_eq!(ids, vec![created.id()]);
    assert_eq!(runnable[0].total_steps(), 2);

    let parked_sagas = store.load_parked().await.unwrap();
    assert_eq!(parked_sagas.len(), 1);
    assert_eq!(parked_sagas[0].parked(), Some(ParkReason::CompensationFailed));
}

#[tokio::test]
#[serial]
async fn lease_excludes_other_workers_until_expiry() {
    let store = get_test_store().await;
    let mut saga = create_test_saga();
    store.persist(&mut saga).await.unwrap();
    let now = Utc::now();
    let ttl = Duration::from_secs(30);

    assert!(store.try_acquire_lease(saga.id(), "a", ttl, now).await.unwrap());
    assert!(!store.try_acquire_lease(saga.id(), "b", ttl, now).await.unwrap());
    assert!(store.load_runnable(now).await.unwrap().is_empty());

    // Saving does not drop the lease.
    saga.start(now).unwrap();
    store.persist(&mut saga).await.unwrap();
    assert!(!store.try_acquire_lease(saga.id(), "b", ttl, now).await.unwrap());

    let expired = now + chrono::Duration::seconds(30);
    assert!(store.try_acquire_lease(saga.id(), "b", ttl, expired).await.unwrap());

    store.release_lease(saga.id(), "b").await.unwrap();
    assert!(store.try_acquire_lease(saga.id(), "a", ttl, now).await.unwrap());
}

#[tokio::test]
#[serial]
async fn lease_on_unknown_saga_fails() {
    let store = get_test_store().await;
    let result = store
        .try_acquire_lease(SagaId::new(), "a", Duration::from_secs(1), Utc::now())
        .await;
    assert!(matches!(result, Err(StoreError::SagaNotFound(_))));
}

#[tokio::test]
#[serial]
async fn archive_only_terminal_sagas() {
    let store = get_test_store().await;
    let now = Utc::now();
    let mut saga = Saga::new("T", "n", "c");
    saga.add_step(SagaStep::new("only", "svc", "Do", Value::Null))
        .unwrap();
    store.persist(&mut saga).await.unwrap();

    assert!(matches!(
        store.archive(saga.id()).await,
        Err(StoreError::NotTerminal { status: SagaStatus::Created, .. })
    ));
    assert!(matches!(
        store.archive(SagaId::new()).await,
        Err(StoreError::SagaNotFound(_))
    ));

    saga.start(now).unwrap();
    saga.start_step(0, now).unwrap();
    saga.complete_step(0, Value::Null, now).unwrap();
    saga.complete(now).unwrap();
    store.persist(&mut saga).await.unwrap();
    store.archive(saga.id()).await.unwrap();

    assert!(store.load(saga.id()).await.unwrap().is_some());
    assert!(store.load_runnable(now).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn corrupt_rows_are_reported() {
    let store = get_test_store().await;
    let mut saga = create_test_saga();
    store.persist(&mut saga).await.unwrap();

    sqlx::query("UPDATE saga_steps SET status = 'Exploded' WHERE saga_id = $1")
        .bind(saga.id().as_uuid())
        .execute(store.pool())
        .await
        .unwrap();

    assert!(matches!(
        store.load(saga.id()).await,
        Err(StoreError::Corrupt(_))
    ));
}
