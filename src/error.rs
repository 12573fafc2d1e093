//! Error types for the task scheduling core.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Shared queue store errors.
///
/// These are transient from the scheduler's point of view: the poll loop
/// logs them and tries again on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Task {id} already exists")]
    DuplicateTask { id: String },
}

impl StoreError {
    /// Shorthand for a failed store command.
    pub fn command(command: impl Into<String>, reason: impl ToString) -> Self {
        Self::Command {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

/// Worker pool lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Worker pool {name} is not running")]
    NotRunning { name: String },

    #[error("Worker pool {name} did not stop within {timeout:?}")]
    ShutdownTimeout { name: String, timeout: Duration },
}

/// In-process orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Maximum tracked tasks ({max}) exceeded")]
    CapacityExceeded { max: usize },

    #[error("Task {id} already submitted")]
    DuplicateTask { id: String },

    #[error("Failed to create agent {agent_id}: {reason}")]
    AgentCreation { agent_id: String, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
