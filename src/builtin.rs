//! Built-in collaborators: an `echo` executor for queued tasks and an echo
//! agent for the orchestrator. Useful for smoke-testing a deployment.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::orchestrator::{
    AgentExecutor, AgentFactory, AgentParams, AgentResponse, OrchestratorTask, TokenUsage,
};
use crate::worker::{ExecutionContext, TaskExecutor};

/// Kind name the echo executor is registered under.
pub const ECHO_KIND: &str = "echo";

/// Returns the task payload unchanged.
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        Ok(ctx.payload)
    }
}

/// Replies with the prompt it was given.
pub struct EchoAgent;

#[async_trait]
impl AgentExecutor for EchoAgent {
    async fn run(&self, task: &OrchestratorTask) -> anyhow::Result<AgentResponse> {
        let words = task.prompt.split_whitespace().count() as u32;
        Ok(AgentResponse {
            response: task.prompt.clone(),
            tool_calls: Vec::new(),
            usage: TokenUsage {
                input_tokens: words,
                output_tokens: words,
            },
        })
    }
}

pub struct EchoAgentFactory;

#[async_trait]
impl AgentFactory for EchoAgentFactory {
    async fn create(&self, _params: &AgentParams) -> anyhow::Result<Arc<dyn AgentExecutor>> {
        Ok(Arc::new(EchoAgent))
    }
}
