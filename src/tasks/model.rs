//! Task record model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RecordConfig;
use crate::tasks::state::TaskStatus;

/// Partition used when a submission does not name one.
pub const DEFAULT_PARTITION: &str = "background";

/// How far ahead in the FIFO each priority level moves a task.
const PRIORITY_STEP_MS: i64 = 60_000;

/// Discriminator selecting which executor handles a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    /// Summarize stale conversation context.
    Compaction,
    /// Spawn an isolated sub-agent.
    SubAgent,
    /// Run one generic agent turn.
    AgentTurn,
    /// Application-defined kind.
    Custom(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Compaction => "compaction",
            Self::SubAgent => "sub_agent",
            Self::AgentTurn => "agent_turn",
            Self::Custom(name) => name.as_str(),
        }
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "compaction" => Self::Compaction,
            "sub_agent" => Self::SubAgent,
            "agent_turn" => Self::AgentTurn,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory progress reported by an executor mid-flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Completion estimate, 0-100.
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A task submission before it becomes a record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Option<String>,
    pub kind: TaskKind,
    pub partition: String,
    pub payload: serde_json::Value,
    pub priority: i32,
}

impl NewTask {
    pub fn new(kind: impl Into<TaskKind>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            partition: DEFAULT_PARTITION.to_string(),
            payload,
            priority: 0,
        }
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// The serializable state of one schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    /// Logical queue (e.g. a session) the task was submitted to.
    pub partition: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only on the transition to `Running`.
    #[serde(default)]
    pub assigned_worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
}

impl TaskRecord {
    /// Create a pending record from a submission.
    pub fn new(task: NewTask) -> Self {
        Self {
            id: task.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: task.kind,
            partition: task.partition,
            payload: task.payload,
            status: TaskStatus::Pending,
            priority: task.priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_worker_id: None,
            result: None,
            error: None,
            progress: None,
        }
    }

    /// Ordering score in the pending set; lower is claimed first.
    pub fn score(&self) -> f64 {
        let millis = self.created_at.timestamp_millis();
        (millis - i64::from(self.priority) * PRIORITY_STEP_MS) as f64
    }

    fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, target
            ));
        }
        self.status = target;
        Ok(())
    }

    /// Stamp the claim: `Running`, `started_at` and the owning worker.
    pub fn mark_running(&mut self, worker_id: &str) -> Result<(), String> {
        self.transition_to(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.assigned_worker_id = Some(worker_id.to_string());
        Ok(())
    }

    /// Record a successful result.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), String> {
        self.transition_to(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Record a failure.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), String> {
        self.transition_to(TaskStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.result = None;
        Ok(())
    }

    /// Update advisory progress. Ignored unless the task is running.
    pub fn set_progress(&mut self, percent: u8, message: Option<String>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.progress = Some(TaskProgress {
            percent: percent.min(100),
            message,
        });
        true
    }

    /// Store TTL for the record in its current status.
    pub fn ttl(&self, config: &RecordConfig) -> Duration {
        if self.status.is_terminal() {
            config.record_ttl_terminal
        } else {
            config.record_ttl_active
        }
    }

    /// Time spent waiting in the pending ordering.
    pub fn queue_wait(&self) -> Option<chrono::Duration> {
        self.started_at.map(|start| start - self.created_at)
    }

    /// Time spent executing, for terminal records.
    pub fn run_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_names_round_trip_through_strings() {
        assert_eq!(TaskKind::from("sub_agent"), TaskKind::SubAgent);
        assert_eq!(TaskKind::from("echo"), TaskKind::Custom("echo".to_string()));
        assert_eq!(
            serde_json::to_string(&TaskKind::Compaction).unwrap(),
            "\"compaction\""
        );
        let kind: TaskKind = serde_json::from_str("\"summarize\"").unwrap();
        assert_eq!(kind.as_str(), "summarize");
    }

    #[test]
    fn new_record_is_pending_with_generated_id() {
        let record = TaskRecord::new(NewTask::new("echo", json!("hi")));
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.partition, DEFAULT_PARTITION);
        assert!(Uuid::parse_str(&record.id).is_ok());
        assert!(record.assigned_worker_id.is_none());
    }

    #[test]
    fn explicit_id_is_kept() {
        let record = TaskRecord::new(NewTask::new("echo", json!(null)).with_id("task-1"));
        assert_eq!(record.id, "task-1");
    }

    #[test]
    fn lifecycle_stamps_timestamps() {
        let mut record = TaskRecord::new(NewTask::new(TaskKind::AgentTurn, json!({})));
        record.mark_running("worker-a").unwrap();
        assert_eq!(record.assigned_worker_id.as_deref(), Some("worker-a"));
        assert!(record.started_at.is_some());
        assert!(record.queue_wait().is_some());

        record.complete(json!("done")).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.completed_at.is_some());
        assert!(record.run_time().is_some());
    }

    #[test]
    fn result_and_error_are_exclusive() {
        let mut record = TaskRecord::new(NewTask::new("echo", json!(null)));
        record.mark_running("w").unwrap();
        record.fail("boom").unwrap();
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.result.is_none());
    }

    #[test]
    fn terminal_record_rejects_further_transitions() {
        let mut record = TaskRecord::new(NewTask::new("echo", json!(null)));
        record.mark_running("w").unwrap();
        record.complete(json!(1)).unwrap();
        assert!(record.fail("late").is_err());
        assert!(record.mark_running("other").is_err());
        assert_eq!(record.assigned_worker_id.as_deref(), Some("w"));
    }

    #[test]
    fn progress_only_while_running() {
        let mut record = TaskRecord::new(NewTask::new("echo", json!(null)));
        assert!(!record.set_progress(10, None));
        record.mark_running("w").unwrap();
        assert!(record.set_progress(150, Some("halfway".to_string())));
        assert_eq!(record.progress.as_ref().unwrap().percent, 100);
    }

    #[test]
    fn priority_moves_score_ahead() {
        let low = TaskRecord::new(NewTask::new("echo", json!(null)));
        let mut high = low.clone();
        high.priority = 2;
        assert!(high.score() < low.score());
        assert_eq!(low.score() - high.score(), 120_000.0);
    }

    #[test]
    fn ttl_depends_on_status() {
        let config = RecordConfig::default();
        let mut record = TaskRecord::new(NewTask::new("echo", json!(null)));
        assert_eq!(record.ttl(&config), config.record_ttl_active);
        record.fail("cancelled").unwrap();
        assert_eq!(record.ttl(&config), config.record_ttl_terminal);
    }

    #[test]
    fn json_round_trip_preserves_record() {
        let mut record = TaskRecord::new(NewTask::new("echo", json!({"text": "hi"})).with_priority(1));
        record.mark_running("w").unwrap();
        let parsed = TaskRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
