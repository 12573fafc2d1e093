//! Agent Tasks: distributed background task coordination for agent work.

pub mod builtin;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod store;
pub mod tasks;
pub mod worker;

pub use context::AppContext;
pub use error::{Error, Result};
