//! Lifecycle events: best-effort notifications on the `updates` channel.
//!
//! Every `started`, `progress`, `completed` and `failed` transition is
//! published as a JSON `TaskEvent` so observers never need to poll task
//! records. Delivery is fire-and-forget: a failed publish is logged and
//! never affects the task it describes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{KeySpace, QueueStore};
use crate::tasks::{TaskProgress, TaskRecord, TaskStatus};

/// Which lifecycle transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEventKind {
    #[serde(rename = "task_started")]
    Started,
    #[serde(rename = "task_progress")]
    Progress,
    #[serde(rename = "task_completed")]
    Completed,
    #[serde(rename = "task_failed")]
    Failed,
}

impl TaskEventKind {
    /// Wire name (matches the serde rename).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "task_started",
            Self::Progress => "task_progress",
            Self::Completed => "task_completed",
            Self::Failed => "task_failed",
        }
    }

    /// Whether this is a terminal event (completed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A structured lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub task_id: String,
    pub partition_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Snapshot a record into an event.
    pub fn from_record(event: TaskEventKind, record: &TaskRecord) -> Self {
        Self {
            event,
            task_id: record.id.clone(),
            partition_id: record.partition.clone(),
            status: record.status,
            progress: match event {
                TaskEventKind::Progress => record.progress.clone(),
                _ => None,
            },
            result: match event {
                TaskEventKind::Completed => record.result.clone(),
                _ => None,
            },
            error: match event {
                TaskEventKind::Failed => record.error.clone(),
                _ => None,
            },
            timestamp: Utc::now(),
        }
    }
}

/// Publishes task events to the store's pub/sub channel.
#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn QueueStore>,
    channel: String,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn QueueStore>, keys: &KeySpace) -> Self {
        Self {
            store,
            channel: keys.updates_channel(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish an event. Never fails; problems are logged and swallowed.
    pub async fn publish(&self, event: &TaskEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %event.task_id, error = %e, "Failed to serialize task event");
                return;
            }
        };

        match self.store.publish(&self.channel, &payload).await {
            Ok(receivers) => debug!(
                task_id = %event.task_id,
                event = event.event.as_str(),
                receivers,
                "Published task event"
            ),
            Err(e) => warn!(
                task_id = %event.task_id,
                event = event.event.as_str(),
                error = %e,
                "Failed to publish task event"
            ),
        }
    }

    /// Publish the event describing `record`'s latest transition.
    pub async fn publish_record(&self, kind: TaskEventKind, record: &TaskRecord) {
        self.publish(&TaskEvent::from_record(kind, record)).await;
    }
}
