//! In-process task orchestrator and agent cache.

pub mod agents;
pub mod manager;
pub mod model;

pub use agents::{AgentCache, AgentExecutor, AgentFactory, CachedAgent};
pub use manager::{OrchestratorStats, TaskOrchestrator};
pub use model::{
    AgentParams, AgentResponse, OrchestratorTask, TaskResult, TaskResultStatus, TokenUsage,
    ToolCall,
};
