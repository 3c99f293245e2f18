//! Worker pool that polls the store for runnable sagas.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::error::{OrchestratorError, Result};
use crate::lease::ClaimSet;
use crate::orchestrator::Orchestrator;

/// Runs sagas concurrently, one task per saga, bounded by a semaphore.
///
/// The store lease keeps other processes away from a saga; the in-flight set
/// keeps this pool from spawning a second task for a saga it is already
/// driving. A saga leaves the set when its task ends, even by panicking.
#[derive(Clone)]
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    in_flight: ClaimSet,
    size: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Creates a pool sized and paced by the orchestrator's configuration.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let size = orchestrator.config().worker_pool_size.max(1);
        let poll_interval = orchestrator.config().poll_interval;
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(size)),
            in_flight: ClaimSet::default(),
            size,
            poll_interval,
        }
    }

    /// Number of sagas currently being driven by this pool.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Loads runnable sagas and spawns a task for each one not already in
    /// flight, as long as permits remain. Returns the number spawned.
    pub async fn poll_once(&self) -> Result<usize> {
        let runnable = self
            .orchestrator
            .store()
            .load_runnable(Utc::now())
            .await?;

        let mut spawned = 0;
        for saga in runnable {
            let saga_id = saga.id();
            let Some(claim) = self.in_flight.claim(saga_id) else {
                continue;
            };
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };

            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let _claim = claim;
                let _permit = permit;
                match orchestrator.run(saga_id).await {
                    Ok(saga) => {
                        tracing::debug!(%saga_id, status = %saga.status(), "worker finished saga");
                    }
                    Err(OrchestratorError::LeaseHeld(_)) => {
                        tracing::debug!(%saga_id, "saga leased elsewhere, skipping");
                    }
                    Err(err) => {
                        tracing::error!(%saga_id, error = %err, "worker failed to drive saga");
                    }
                }
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Polls until `shutdown` turns true, then waits for in-flight sagas.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.orchestrator.config().worker_id,
            size = self.size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "worker pool started"
        );

        while !*shutdown.borrow() {
            if let Err(err) = self.poll_once().await {
                tracing::error!(error = %err, "failed to poll runnable sagas");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let size = u32::try_from(self.size).unwrap_or(u32::MAX);
        let _drained = self.permits.acquire_many(size).await;
        tracing::info!("worker pool stopped");
    }

    /// Spawns [`WorkerPool::run`] on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
