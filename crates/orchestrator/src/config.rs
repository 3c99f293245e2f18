//! Orchestrator configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_ATTEMPTS};
use uuid::Uuid;

use crate::definition::InstanceDefaults;
use crate::error::{OrchestratorError, Result};
use crate::retry::RetryPolicy;

/// Orchestrator settings with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_MAX_RETRIES`: default per-step retry budget (default: `3`)
/// - `SAGA_STEP_TIMEOUT_MS`: dispatch timeout for steps without their own (default: `30000`)
/// - `SAGA_TIMEOUT_MS`: default saga timeout (default: none)
/// - `SAGA_MAX_RETRY_ATTEMPTS`: saga-level recovery budget (default: `3`)
/// - `SAGA_BACKOFF_BASE_MS` / `SAGA_BACKOFF_CAP_MS`: retry backoff (default: `100` / `30000`)
/// - `SAGA_WORKER_POOL_SIZE`: concurrently driven sagas (default: `16`)
/// - `SAGA_POLL_INTERVAL_MS`: worker poll interval (default: `1000`)
/// - `SAGA_LEASE_TTL_MS`: saga lease duration (default: `90000`)
/// - `SAGA_WAIT_TIMEOUT_MS`: how long an inline run waits on a saga a worker
///   already drives (default: `30000`)
/// - `SAGA_WORKER_ID`: lease owner name (default: random)
///
/// The lease must outlast one dispatch plus the longest backoff, since it is
/// renewed only between dispatches.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub step_timeout: Duration,
    pub saga_timeout: Option<Duration>,
    pub max_retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub worker_pool_size: usize,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub wait_timeout: Duration,
    pub worker_id: String,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_retries: env_or("SAGA_MAX_RETRIES", defaults.max_retries),
            step_timeout: env_millis("SAGA_STEP_TIMEOUT_MS").unwrap_or(defaults.step_timeout),
            saga_timeout: env_millis("SAGA_TIMEOUT_MS"),
            max_retry_attempts: env_or("SAGA_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
            backoff_base: env_millis("SAGA_BACKOFF_BASE_MS").unwrap_or(defaults.backoff_base),
            backoff_cap: env_millis("SAGA_BACKOFF_CAP_MS").unwrap_or(defaults.backoff_cap),
            worker_pool_size: env_or("SAGA_WORKER_POOL_SIZE", defaults.worker_pool_size).max(1),
            poll_interval: env_millis("SAGA_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            lease_ttl: env_millis("SAGA_LEASE_TTL_MS").unwrap_or(defaults.lease_ttl),
            wait_timeout: env_millis("SAGA_WAIT_TIMEOUT_MS").unwrap_or(defaults.wait_timeout),
            worker_id: std::env::var("SAGA_WORKER_ID").unwrap_or(defaults.worker_id),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings under which a saga lease could lapse mid-dispatch.
    pub fn validate(&self) -> Result<()> {
        let longest_hold = self.step_timeout.saturating_add(self.backoff_cap);
        if self.lease_ttl <= longest_hold {
            return Err(OrchestratorError::InvalidConfig(format!(
                "lease ttl {}ms must exceed step timeout plus backoff cap ({}ms)",
                self.lease_ttl.as_millis(),
                longest_hold.as_millis()
            )));
        }
        if self.worker_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "worker id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base, self.backoff_cap)
    }

    /// Values applied to sagas built from definitions that leave them unset.
    pub fn instance_defaults(&self) -> InstanceDefaults {
        InstanceDefaults {
            max_retries: self.max_retries,
            max_retry_attempts: self.max_retry_attempts,
            saga_timeout: self.saga_timeout,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            step_timeout: Duration::from_secs(30),
            saga_timeout: None,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(30),
            worker_pool_size: 16,
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(90),
            wait_timeout: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
