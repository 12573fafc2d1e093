//! Worker pool: polls partitions, claims tasks and runs them under a
//! per-process concurrency ceiling.
//!
//! Two flavours share this core:
//! - `WorkerPool::background` serves a fixed partition list.
//! - `WorkerPool::sessions` also discovers partitions from the keyspace.
//!
//! Lifecycle: `Stopped → Running → Stopping → Stopped`. Shutdown first
//! lets the poll loop finish any claim it is part way through, then aborts
//! in-flight executions; their records stay `running` in the store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, StoreError};
use crate::tasks::{TaskQueue, TaskRecord};
use crate::worker::claim::{ClaimOutcome, Claimer};
use crate::worker::execution::{self, ExecutorRegistry};
use crate::worker::partitions::PartitionSource;

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Stopped,
    Running,
    Stopping,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of a pool for health endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub worker_id: String,
    pub state: PoolState,
    pub pool_size: usize,
    pub running: usize,
    pub available_permits: usize,
}

pub struct WorkerPool {
    name: String,
    config: PoolConfig,
    queue: TaskQueue,
    claimer: Claimer,
    executors: Arc<ExecutorRegistry>,
    partitions: PartitionSource,
    admission: Arc<Semaphore>,
    running_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    state: RwLock<PoolState>,
    /// Set to `true` to ask the poll loop to stop after its current claim.
    stop: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Pool for compaction and sub-agent work on `config.partitions`.
    pub fn background(
        queue: TaskQueue,
        executors: Arc<ExecutorRegistry>,
        config: PoolConfig,
        worker_id: impl Into<String>,
    ) -> Arc<Self> {
        let partitions = PartitionSource::fixed(config.partitions.clone());
        Self::build("background", queue, executors, config, worker_id.into(), partitions)
    }

    /// Pool for per-session work. Partitions are discovered from pending
    /// keys each cycle and can also be registered explicitly. The
    /// background partitions in `config.partitions` are left to the
    /// background pool.
    pub fn sessions(
        queue: TaskQueue,
        executors: Arc<ExecutorRegistry>,
        config: PoolConfig,
        worker_id: impl Into<String>,
    ) -> Arc<Self> {
        let partitions =
            PartitionSource::discovering(Vec::new()).excluding(config.partitions.clone());
        Self::build("sessions", queue, executors, config, worker_id.into(), partitions)
    }

    fn build(
        name: &str,
        queue: TaskQueue,
        executors: Arc<ExecutorRegistry>,
        config: PoolConfig,
        worker_id: String,
        partitions: PartitionSource,
    ) -> Arc<Self> {
        let claimer = Claimer::new(queue.clone(), worker_id, config.claim_candidates);
        Arc::new(Self {
            name: name.to_string(),
            admission: Arc::new(Semaphore::new(config.pool_size)),
            config,
            queue,
            claimer,
            executors,
            partitions,
            running_tasks: Mutex::new(HashMap::new()),
            state: RwLock::new(PoolState::Stopped),
            stop: watch::channel(false).0,
            loop_handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_id(&self) -> &str {
        self.claimer.worker_id()
    }

    pub async fn state(&self) -> PoolState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == PoolState::Running
    }

    pub async fn register_partition(&self, partition: impl Into<String>) -> bool {
        self.partitions.register(partition).await
    }

    pub async fn unregister_partition(&self, partition: &str) -> bool {
        self.partitions.unregister(partition).await
    }

    /// Partitions the next poll cycle would serve.
    pub async fn partitions(&self) -> Result<Vec<String>, StoreError> {
        self.partitions.resolve(&self.queue).await
    }

    /// Ids of tasks this pool is executing (or has not yet reaped).
    pub async fn running_task_ids(&self) -> Vec<String> {
        self.running_tasks.lock().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            worker_id: self.worker_id().to_string(),
            state: self.state().await,
            pool_size: self.config.pool_size,
            running: self.running_tasks.lock().await.len(),
            available_permits: self.admission.available_permits(),
        }
    }

    /// Start the poll loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        // Held until the handle is stored so a concurrent shutdown always
        // finds the loop it has to wait for.
        let mut loop_handle = self.loop_handle.lock().await;
        {
            let mut state = self.state.write().await;
            if *state != PoolState::Stopped {
                return Err(PoolError::AlreadyRunning {
                    name: self.name.clone(),
                });
            }
            *state = PoolState::Running;
        }

        self.stop.send_replace(false);
        let stop = self.stop.subscribe();
        let pool = Arc::clone(self);
        *loop_handle = Some(tokio::spawn(async move { pool.poll_loop(stop).await }));
        drop(loop_handle);

        info!(
            pool = %self.name,
            worker_id = %self.worker_id(),
            pool_size = self.config.pool_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop polling and cancel every in-flight execution.
    ///
    /// The poll loop is not aborted: it stops between claims, so a claim
    /// that already removed its id from pending is either dispatched (and
    /// then cancelled here) or abandoned with an error log.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.write().await;
            if *state != PoolState::Running {
                return Err(PoolError::NotRunning {
                    name: self.name.clone(),
                });
            }
            *state = PoolState::Stopping;
        }
        info!(pool = %self.name, "Worker pool stopping");

        self.stop.send_replace(true);
        let loop_handle = self.loop_handle.lock().await.take();
        if let Some(handle) = loop_handle
            && let Err(e) = handle.await
        {
            error!(pool = %self.name, error = %e, "Poll loop panicked");
        }

        let handles: Vec<(String, JoinHandle<()>)> =
            self.running_tasks.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.abort();
        }

        let cancelled = handles.len();
        let results = join_all(
            handles
                .into_iter()
                .map(|(task_id, handle)| async move { (task_id, handle.await) }),
        )
        .await;
        for (task_id, result) in results {
            match result {
                Ok(()) => debug!(task_id = %task_id, "Task finished before cancellation"),
                Err(e) if e.is_cancelled() => info!(
                    task_id = %task_id,
                    pool = %self.name,
                    "Task cancelled; record left running"
                ),
                Err(e) => warn!(task_id = %task_id, error = %e, "Task panicked during shutdown"),
            }
        }

        *self.state.write().await = PoolState::Stopped;
        info!(pool = %self.name, cancelled, "Worker pool stopped");
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut cycle: usize = 0;
        while !self.stop_requested() {
            self.reap_finished().await;

            let running = self.running_tasks.lock().await.len();
            let available = self.config.pool_size.saturating_sub(running);
            if available > 0 {
                match self.poll_once(available, cycle).await {
                    Ok(0) => {}
                    Ok(claimed) => debug!(pool = %self.name, claimed, "Poll cycle claimed tasks"),
                    Err(e) => warn!(
                        pool = %self.name,
                        error = %e,
                        "Poll cycle failed, retrying next tick"
                    ),
                }
            }

            cycle = cycle.wrapping_add(1);
            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(pool = %self.name, "Poll loop exited");
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Make up to `available` claim attempts across this cycle's partitions.
    ///
    /// Partitions are visited round-robin, starting one further along each
    /// cycle so a busy partition cannot starve the rest. A partition that
    /// comes back empty is dropped for the remainder of the cycle.
    async fn poll_once(self: &Arc<Self>, available: usize, cycle: usize) -> Result<usize, StoreError> {
        let partitions = self.partitions.resolve(&self.queue).await?;
        if partitions.is_empty() {
            return Ok(0);
        }

        let mut queue: VecDeque<String> = partitions.into();
        let offset = cycle % queue.len();
        queue.rotate_left(offset);

        let mut claimed = 0;
        let mut attempts = 0;
        while attempts < available
            && !self.stop_requested()
            && let Some(partition) = queue.pop_front()
        {
            attempts += 1;
            match self.claimer.claim_next(&partition).await? {
                ClaimOutcome::Won(record) => {
                    self.dispatch(record).await;
                    claimed += 1;
                    queue.push_back(partition);
                }
                ClaimOutcome::Empty => {}
                ClaimOutcome::Lost | ClaimOutcome::Abandoned { .. } => queue.push_back(partition),
            }
        }
        Ok(claimed)
    }

    /// Spawn execution of a claimed record behind the admission semaphore.
    async fn dispatch(self: &Arc<Self>, record: TaskRecord) {
        let task_id = record.id.clone();
        let admission = Arc::clone(&self.admission);
        let queue = self.queue.clone();
        let executors = Arc::clone(&self.executors);

        // Hold the map across the spawn so the handle is tracked before
        // anyone can drain the map.
        let mut running = self.running_tasks.lock().await;
        let handle = tokio::spawn(async move {
            let Ok(_permit) = admission.acquire_owned().await else {
                return;
            };
            execution::run_task(&queue, &executors, record).await;
        });
        running.insert(task_id, handle);
    }

    async fn reap_finished(&self) -> usize {
        let mut running = self.running_tasks.lock().await;
        let before = running.len();
        running.retain(|_, handle| !handle.is_finished());
        before - running.len()
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.poll_interval;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.config.poll_interval + Duration::from_millis(jitter)
    }
}
