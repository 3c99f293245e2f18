//! Saga outcome notifications for business services.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use saga::{ParkReason, Saga, SagaId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Outcomes published when a saga reaches a state business services care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaNotification {
    /// Every step completed.
    SagaCompleted(SagaCompletedData),

    /// All compensable work was undone.
    SagaCompensated(SagaCompensatedData),

    /// The saga needs an operator.
    SagaParked(SagaParkedData),

    /// An operator abandoned the saga.
    SagaFailed(SagaFailedData),
}

/// Data for SagaCompleted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    /// Accumulated step results.
    pub context: BTreeMap<String, Value>,
    pub completed_at: DateTime<Utc>,
}

/// Data for SagaCompensated notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompensatedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    /// Why the saga was rolled back.
    pub reason: Option<String>,
    /// Completed steps left in place because they had no compensating action.
    pub skipped_steps: Vec<u32>,
}

/// Data for SagaParked notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaParkedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    pub reason: ParkReason,
    /// Steps whose compensation failed.
    pub failed_steps: Vec<u32>,
    pub error: Option<String>,
}

/// Data for SagaFailed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: String,
    pub error: Option<String>,
    pub failed_steps: Vec<u32>,
}

impl SagaNotification {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaNotification::SagaCompleted(_) => "SagaCompleted",
            SagaNotification::SagaCompensated(_) => "SagaCompensated",
            SagaNotification::SagaParked(_) => "SagaParked",
            SagaNotification::SagaFailed(_) => "SagaFailed",
        }
    }

    pub fn saga_id(&self) -> SagaId {
        match self {
            SagaNotification::SagaCompleted(data) => data.saga_id,
            SagaNotification::SagaCompensated(data) => data.saga_id,
            SagaNotification::SagaParked(data) => data.saga_id,
            SagaNotification::SagaFailed(data) => data.saga_id,
        }
    }

    /// Creates a SagaCompleted notification.
    pub fn completed(saga: &Saga) -> Self {
        SagaNotification::SagaCompleted(SagaCompletedData {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            context: saga.context().clone(),
            completed_at: saga.completed_at().unwrap_or_else(Utc::now),
        })
    }

    /// Creates a SagaCompensated notification.
    pub fn compensated(saga: &Saga) -> Self {
        SagaNotification::SagaCompensated(SagaCompensatedData {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            reason: saga.error_message().map(str::to_string),
            skipped_steps: saga.skipped_compensations().to_vec(),
        })
    }

    /// Creates a SagaParked notification, or None if the saga is not parked.
    pub fn parked(saga: &Saga) -> Option<Self> {
        let reason = saga.parked()?;
        Some(SagaNotification::SagaParked(SagaParkedData {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            reason,
            failed_steps: saga.failed_compensations(),
            error: saga.error_message().map(str::to_string),
        }))
    }

    /// Creates a SagaFailed notification.
    pub fn failed(saga: &Saga) -> Self {
        SagaNotification::SagaFailed(SagaFailedData {
            saga_id: saga.id(),
            saga_type: saga.saga_type().to_string(),
            correlation_id: saga.correlation_id().to_string(),
            error: saga.error_message().map(str::to_string),
            failed_steps: saga.failed_compensations(),
        })
    }
}

/// Broadcast channel carrying [`SagaNotification`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<SagaNotification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SagaNotification> {
        self.sender.subscribe()
    }

    /// Publishes a notification. Having no subscribers is not an error.
    pub fn publish(&self, notification: SagaNotification) {
        let event_type = notification.event_type();
        let saga_id = notification.saga_id();
        let receivers = self.sender.send(notification).unwrap_or(0);
        tracing::debug!(%saga_id, event_type, receivers, "saga notification published");
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}
