//! Task execution: running a claimed record through its executor and
//! writing the terminal state back.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::TaskEventKind;
use crate::tasks::{TaskKind, TaskQueue, TaskRecord, TaskStatus};

/// Everything an executor gets to see about the task it runs.
pub struct ExecutionContext {
    pub task_id: String,
    pub partition: String,
    pub kind: TaskKind,
    pub payload: Value,
    progress: ProgressReporter,
}

impl ExecutionContext {
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Shorthand for `self.progress().report(..)`.
    pub async fn report_progress(&self, percent: u8, message: Option<String>) {
        self.progress.report(percent, message).await;
    }
}

/// Opaque unit of work bound to one task kind.
///
/// Returning an error marks the task failed; the error chain becomes the
/// record's `error` text. Panics are treated the same way.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<Value>;
}

/// Writes advisory progress onto a running record.
///
/// Clones share one gate with the terminal write in [`run_task`]: a report
/// either lands before the outcome is written or is dropped, even when the
/// clone outlives `execute`.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: TaskQueue,
    task_id: String,
    /// `true` once the task's outcome is being written.
    closed: Arc<Mutex<bool>>,
}

impl ProgressReporter {
    pub(crate) fn new(queue: TaskQueue, task_id: impl Into<String>) -> Self {
        Self {
            queue,
            task_id: task_id.into(),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Record progress and publish `task_progress`.
    ///
    /// No-op once the task has finished or the record has left `running`.
    /// Store failures are logged.
    pub async fn report(&self, percent: u8, message: Option<String>) {
        let closed = self.closed.lock().await;
        if *closed {
            debug!(task_id = %self.task_id, "Progress after the task finished, ignoring");
            return;
        }

        let mut record = match self.queue.get(&self.task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(task_id = %self.task_id, "Progress for a record that no longer exists");
                return;
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Failed to load record for progress");
                return;
            }
        };

        if !record.set_progress(percent, message) {
            return;
        }

        if let Err(e) = self.queue.save(&record).await {
            warn!(task_id = %self.task_id, error = %e, "Failed to persist progress");
            return;
        }
        self.queue
            .publisher()
            .publish_record(TaskEventKind::Progress, &record)
            .await;
    }
}

/// Maps task kinds to the executors that handle them.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<TaskKind, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Register an executor, replacing any previous one for `kind`.
    pub async fn register(&self, kind: impl Into<TaskKind>, executor: Arc<dyn TaskExecutor>) {
        let kind = kind.into();
        debug!(kind = %kind, "Registered executor");
        self.executors.write().await.insert(kind, executor);
    }

    pub async fn unregister(&self, kind: &TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.write().await.remove(kind)
    }

    pub async fn get(&self, kind: &TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().await.get(kind).cloned()
    }

    pub async fn has(&self, kind: &TaskKind) -> bool {
        self.executors.read().await.contains_key(kind)
    }

    /// Registered kinds, sorted by name.
    pub async fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.executors.read().await.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub async fn count(&self) -> usize {
        self.executors.read().await.len()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Execute a claimed record and persist its terminal state.
///
/// Never returns an error: executor failures become a `failed` record and
/// store failures on the terminal write are logged. Returns the record as
/// this worker last saw it.
pub async fn run_task(
    queue: &TaskQueue,
    executors: &ExecutorRegistry,
    record: TaskRecord,
) -> TaskRecord {
    let progress = ProgressReporter::new(queue.clone(), record.id.clone());
    let progress_gate = Arc::clone(&progress.closed);
    let ctx = ExecutionContext {
        task_id: record.id.clone(),
        partition: record.partition.clone(),
        kind: record.kind.clone(),
        payload: record.payload.clone(),
        progress,
    };

    let outcome = match executors.get(&record.kind).await {
        Some(executor) => match AssertUnwindSafe(executor.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "executor panicked: {}",
                panic_message(panic.as_ref())
            )),
        },
        None => Err(anyhow::anyhow!(
            "no executor registered for kind {}",
            record.kind
        )),
    };

    // Held until the outcome is persisted so no report can interleave.
    let mut closed = progress_gate.lock().await;
    *closed = true;

    // Pick up progress written while the executor ran.
    let mut record = match queue.get(&record.id).await {
        Ok(Some(latest)) if latest.status == TaskStatus::Running => latest,
        _ => record,
    };

    let (transition, kind) = match outcome {
        Ok(result) => (record.complete(result), TaskEventKind::Completed),
        Err(e) => {
            let message = format!("{e:#}");
            warn!(task_id = %record.id, kind = %record.kind, error = %message, "Task failed");
            (record.fail(message), TaskEventKind::Failed)
        }
    };

    if let Err(reason) = transition {
        error!(task_id = %record.id, %reason, "Cannot record task outcome");
        return record;
    }

    if let Err(e) = queue.finish(&record).await {
        error!(
            task_id = %record.id,
            partition = %record.partition,
            error = %e,
            "Failed to persist terminal task state"
        );
    }
    drop(closed);
    queue.publisher().publish_record(kind, &record).await;

    if kind == TaskEventKind::Completed {
        info!(
            task_id = %record.id,
            kind = %record.kind,
            run_ms = record.run_time().map(|d| d.num_milliseconds()).unwrap_or_default(),
            "Task completed"
        );
    }
    record
}
