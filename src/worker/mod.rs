//! Worker system: claiming and executing queued tasks.
//!
//! Core components:
//! - `claim`: Claim protocol (atomic removal from pending decides ownership)
//! - `execution`: Executor trait, registry and terminal write-back
//! - `partitions`: Which partitions a pool polls
//! - `pool`: Poll loop with a per-process concurrency ceiling

pub mod claim;
pub mod execution;
pub mod partitions;
pub mod pool;

pub use claim::{ClaimOutcome, Claimer};
pub use execution::{
    ExecutionContext, ExecutorRegistry, ProgressReporter, TaskExecutor, run_task,
};
pub use partitions::PartitionSource;
pub use pool::{PoolState, PoolStats, WorkerPool};

/// Identity stamped on records this process claims: host, pid and a short
/// random suffix so restarted processes are distinguishable.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}
