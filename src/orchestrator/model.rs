//! Orchestrator task and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which agent a task is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentParams {
    pub agent_id: String,
    /// A cached agent is reused only for the session it was built for.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Opaque creation options handed to the agent factory.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentParams {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// An ad hoc task submitted directly to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorTask {
    /// Assigned at submission when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub agent: AgentParams,
    pub prompt: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl OrchestratorTask {
    pub fn new(agent: AgentParams, prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            agent,
            prompt: prompt.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Status of an orchestrator task as seen by `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Sentinel for ids the orchestrator does not know (or already reaped).
    NotFound,
}

impl TaskResultStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::NotFound => "NOT_FOUND",
        };
        write!(f, "{}", s)
    }
}

/// Token usage reported by an agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// One tool invocation made during an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// What an agent returns from a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Observable state of an orchestrator task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn pending(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskResultStatus::Pending,
            response: None,
            tool_calls: Vec::new(),
            usage: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn not_found(task_id: impl Into<String>) -> Self {
        Self {
            status: TaskResultStatus::NotFound,
            ..Self::pending(task_id)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns `false` unless the task was pending.
    pub(crate) fn mark_running(&mut self) -> bool {
        if self.status != TaskResultStatus::Pending {
            return false;
        }
        self.status = TaskResultStatus::Running;
        self.updated_at = Utc::now();
        true
    }

    pub(crate) fn complete(&mut self, response: AgentResponse) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskResultStatus::Completed;
        self.response = Some(response.response);
        self.tool_calls = response.tool_calls;
        self.usage = Some(response.usage);
        self.error = None;
        self.updated_at = Utc::now();
        true
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskResultStatus::Failed;
        self.error = Some(error.into());
        self.response = None;
        self.updated_at = Utc::now();
        true
    }
}
