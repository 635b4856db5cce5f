//! Delivery queue records and operator controls.

use serde::{Deserialize, Serialize};

use crate::dequeue;
use crate::error::{DispatchError, StoreError};
use crate::schedule::QueueSchedule;
use crate::store::{JobStore, QueueStore};

/// Administrative state of a delivery queue.
///
/// Scheduler-triggered dispatch runs while the queue is enabled or draining;
/// draining stops new work from being scheduled onto the queue elsewhere but
/// keeps delivering what is already there. Suspension is the automatic
/// reaction to job exhaustion and holds everything until an operator
/// re-enables the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Enabled,
    Disabled,
    Draining,
    Suspended,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Enabled => "ENABLED",
            QueueState::Disabled => "DISABLED",
            QueueState::Draining => "DRAINING",
            QueueState::Suspended => "SUSPENDED",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, QueueState::Enabled)
    }

    pub fn is_draining(&self) -> bool {
        matches!(self, QueueState::Draining)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, QueueState::Suspended)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for QueueState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ENABLED" => Ok(QueueState::Enabled),
            "DISABLED" => Ok(QueueState::Disabled),
            "DRAINING" => Ok(QueueState::Draining),
            "SUSPENDED" => Ok(QueueState::Suspended),
            other => Err(format!("unknown queue state: {other}")),
        }
    }
}

/// A named delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryQueue {
    pub name: String,
    /// Free-form kind label, surfaced in document activity entries.
    pub queue_type: String,
    pub state: QueueState,
    pub schedule: Option<QueueSchedule>,
}

impl DeliveryQueue {
    pub fn new(name: impl Into<String>, queue_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_type: queue_type.into(),
            state: QueueState::Enabled,
            schedule: None,
        }
    }

    pub fn with_schedule(mut self, schedule: QueueSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_state(mut self, state: QueueState) -> Self {
        self.state = state;
        self
    }

    /// Whether document status writes driven by this queue's retry handling
    /// should be suppressed.
    pub fn status_silence(&self) -> bool {
        self.schedule.as_ref().map_or(false, |s| s.status_silence)
    }
}

async fn set_state(
    store: &dyn QueueStore,
    name: &str,
    state: QueueState,
) -> Result<DeliveryQueue, DispatchError> {
    let mut queue = store
        .get(name)
        .await?
        .ok_or_else(|| DispatchError::UnknownQueue(name.to_string()))?;
    queue.state = state;
    store.update(&queue).await?;
    Ok(queue)
}

/// Resumes delivery on a queue, clearing any suspension.
pub async fn enable(store: &dyn QueueStore, name: &str) -> Result<DeliveryQueue, DispatchError> {
    set_state(store, name, QueueState::Enabled).await
}

/// Stops scheduler-triggered delivery on a queue.
pub async fn disable(store: &dyn QueueStore, name: &str) -> Result<DeliveryQueue, DispatchError> {
    set_state(store, name, QueueState::Disabled).await
}

/// Puts a queue into draining: existing jobs still deliver, new scheduling
/// should stop.
pub async fn drain(store: &dyn QueueStore, name: &str) -> Result<DeliveryQueue, DispatchError> {
    set_state(store, name, QueueState::Draining).await
}

/// Suspends a queue, halting delivery until it is re-enabled.
pub async fn suspend(store: &dyn QueueStore, name: &str) -> Result<DeliveryQueue, DispatchError> {
    set_state(store, name, QueueState::Suspended).await
}

/// Re-reads the queue record, falling back to the copy in hand when the
/// record has vanished mid-run.
pub async fn refresh(
    store: &dyn QueueStore,
    queue: DeliveryQueue,
) -> Result<DeliveryQueue, StoreError> {
    Ok(store.get(&queue.name).await?.unwrap_or(queue))
}

/// Number of jobs currently eligible for delivery on the queue.
pub async fn length(
    store: &dyn JobStore,
    name: &str,
    min_age: Option<chrono::Duration>,
) -> Result<u64, StoreError> {
    dequeue::size(store, name, min_age).await
}

/// Ids of every job attached to the given document, across all queues.
pub async fn jobs_for_document(
    store: &dyn JobStore,
    document_id: &str,
) -> Result<Vec<String>, StoreError> {
    store.ids_for_document(document_id).await
}
