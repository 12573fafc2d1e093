//! Process context: every shared component, built once at startup and
//! handed around by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{PoolError, StoreError};
use crate::events::EventPublisher;
use crate::orchestrator::{AgentFactory, TaskOrchestrator};
use crate::store::{InMemoryStore, KeySpace, QueueStore};
use crate::tasks::{NewTask, TaskQueue, TaskRecord};
use crate::worker::{ExecutorRegistry, WorkerPool, default_worker_id};

pub struct AppContext {
    config: AppConfig,
    store: Arc<dyn QueueStore>,
    queue: TaskQueue,
    executors: Arc<ExecutorRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    worker_id: String,
    pools: Mutex<Vec<Arc<WorkerPool>>>,
}

impl AppContext {
    /// Wire up all components around an existing store.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn QueueStore>,
        agent_factory: Arc<dyn AgentFactory>,
    ) -> Arc<Self> {
        let keys = KeySpace::new(config.store.key_prefix.clone());
        let publisher = EventPublisher::new(Arc::clone(&store), &keys);
        let queue = TaskQueue::new(Arc::clone(&store), keys, config.records.clone(), publisher);
        let orchestrator = TaskOrchestrator::new(config.orchestrator.clone(), agent_factory);

        Arc::new(Self {
            config,
            store,
            queue,
            executors: Arc::new(ExecutorRegistry::new()),
            orchestrator,
            worker_id: default_worker_id(),
            pools: Mutex::new(Vec::new()),
        })
    }

    /// Context backed by a fresh in-process store.
    pub fn in_memory(config: AppConfig, agent_factory: Arc<dyn AgentFactory>) -> Arc<Self> {
        Self::new(config, Arc::new(InMemoryStore::new()), agent_factory)
    }

    /// Pick the store from configuration: Redis when a URL is configured and
    /// the `redis` feature is enabled, the in-memory store otherwise.
    pub async fn from_config(
        config: AppConfig,
        agent_factory: Arc<dyn AgentFactory>,
    ) -> Result<Arc<Self>, StoreError> {
        let store = connect_store(&config).await?;
        Ok(Self::new(config, store, agent_factory))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Enqueue a task for the worker pools.
    pub async fn submit(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        self.queue.enqueue(task).await
    }

    pub async fn start_background_pool(&self) -> Result<Arc<WorkerPool>, PoolError> {
        let pool = WorkerPool::background(
            self.queue.clone(),
            Arc::clone(&self.executors),
            self.config.pool.clone(),
            self.worker_id.clone(),
        );
        self.track(pool).await
    }

    pub async fn start_session_pool(&self) -> Result<Arc<WorkerPool>, PoolError> {
        let pool = WorkerPool::sessions(
            self.queue.clone(),
            Arc::clone(&self.executors),
            self.config.pool.clone(),
            self.worker_id.clone(),
        );
        self.track(pool).await
    }

    async fn track(&self, pool: Arc<WorkerPool>) -> Result<Arc<WorkerPool>, PoolError> {
        pool.start().await?;
        self.pools.lock().await.push(Arc::clone(&pool));
        Ok(pool)
    }

    /// Shut down every pool started through this context, giving each at
    /// most `timeout`. All pools are attempted; the first failure is
    /// returned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        let pools: Vec<Arc<WorkerPool>> = self.pools.lock().await.drain(..).collect();
        let mut first_error = None;

        for pool in pools {
            let outcome = match tokio::time::timeout(timeout, pool.shutdown()).await {
                Ok(Ok(())) | Ok(Err(PoolError::NotRunning { .. })) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(PoolError::ShutdownTimeout {
                    name: pool.name().to_string(),
                    timeout,
                }),
            };
            if let Err(e) = outcome {
                warn!(pool = %pool.name(), error = %e, "Worker pool shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        info!("Application context shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_store(config: &AppConfig) -> Result<Arc<dyn QueueStore>, StoreError> {
    match &config.store.redis_url {
        Some(url) => Ok(Arc::new(crate::store::RedisStore::connect(url).await?)),
        None => {
            info!("No Redis URL configured, using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store(config: &AppConfig) -> Result<Arc<dyn QueueStore>, StoreError> {
    if config.store.redis_url.is_some() {
        warn!("Redis URL configured but the `redis` feature is disabled; using in-memory store");
    }
    Ok(Arc::new(InMemoryStore::new()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::builtin::{EchoAgentFactory, EchoExecutor};
    use crate::config::StoreConfig;
    use crate::tasks::TaskStatus;

    #[tokio::test]
    async fn key_prefix_namespaces_queue() {
        let config = AppConfig {
            store: StoreConfig {
                redis_url: None,
                key_prefix: "tenant".to_string(),
            },
            ..AppConfig::default()
        };
        let ctx = AppContext::in_memory(config, Arc::new(EchoAgentFactory));
        let record = ctx.submit(NewTask::new("echo", json!(1))).await.unwrap();

        let pending = ctx.store().lowest_pending("tenant:pending:background", 10).await.unwrap();
        assert_eq!(pending, vec![record.id]);
    }

    #[tokio::test]
    async fn shutdown_stops_started_pools() {
        let mut config = AppConfig::default();
        config.pool.poll_interval = Duration::from_millis(10);
        let ctx = AppContext::in_memory(config, Arc::new(EchoAgentFactory));
        ctx.executors().register("echo", Arc::new(EchoExecutor)).await;

        let background = ctx.start_background_pool().await.unwrap();
        let sessions = ctx.start_session_pool().await.unwrap();
        let record = ctx.submit(NewTask::new("echo", json!("hi"))).await.unwrap();

        let mut status = TaskStatus::Pending;
        for _ in 0..200 {
            status = ctx.queue().get(&record.id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Completed);

        ctx.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(!background.is_running().await);
        assert!(!sessions.is_running().await);
        // Second call has nothing left to stop.
        ctx.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
