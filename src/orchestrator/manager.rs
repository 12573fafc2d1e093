//! Task orchestrator: in-process tracking of ad hoc agent tasks.
//!
//! Independent of the worker pool: nothing here touches the shared store.
//! `tasks`, `results` and the agent cache each sit behind their own lock,
//! so status reads never wait on agent maintenance. When both task maps are
//! needed they are locked in the order `tasks` then `results`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::orchestrator::agents::{AgentCache, AgentExecutor, AgentFactory};
use crate::orchestrator::model::{
    AgentParams, AgentResponse, OrchestratorTask, TaskResult, TaskResultStatus,
};

/// A submitted task plus the instant it was accepted.
struct TrackedTask {
    task: OrchestratorTask,
    created_at: Instant,
}

/// Counts for health endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub tracked: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub agents: usize,
}

pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    tasks: RwLock<HashMap<String, TrackedTask>>,
    results: RwLock<HashMap<String, TaskResult>>,
    agents: AgentCache,
    last_cleanup: Mutex<Instant>,
}

impl TaskOrchestrator {
    pub fn new(config: OrchestratorConfig, factory: Arc<dyn AgentFactory>) -> Arc<Self> {
        Arc::new(Self {
            agents: AgentCache::new(factory, config.max_agents, config.agent_idle_ttl),
            config,
            tasks: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Accept a task and start running it in the background.
    ///
    /// Returns the task id immediately.
    pub async fn submit(
        self: &Arc<Self>,
        mut task: OrchestratorTask,
    ) -> Result<String, OrchestratorError> {
        self.maybe_cleanup().await;

        let task_id = task
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        task.id = Some(task_id.clone());

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task_id) {
                return Err(OrchestratorError::DuplicateTask { id: task_id });
            }

            if tasks.len() >= self.config.max_tasks {
                let mut results = self.results.write().await;
                let oldest_terminal = tasks
                    .iter()
                    .filter(|(id, _)| results.get(*id).is_some_and(|r| r.is_terminal()))
                    .min_by_key(|(_, tracked)| tracked.created_at)
                    .map(|(id, _)| id.clone());

                match oldest_terminal {
                    Some(id) => {
                        tasks.remove(&id);
                        results.remove(&id);
                        debug!(task_id = %id, "Dropped oldest finished task to make room");
                    }
                    None => {
                        return Err(OrchestratorError::CapacityExceeded {
                            max: self.config.max_tasks,
                        });
                    }
                }
            }

            tasks.insert(
                task_id.clone(),
                TrackedTask {
                    task: task.clone(),
                    created_at: Instant::now(),
                },
            );
            self.results
                .write()
                .await
                .insert(task_id.clone(), TaskResult::pending(&task_id));
        }

        info!(
            task_id = %task_id,
            agent_id = %task.agent.agent_id,
            "Orchestrator task submitted"
        );

        let orchestrator = Arc::clone(self);
        let id = task_id.clone();
        tokio::spawn(async move { orchestrator.execute(id, task).await });

        Ok(task_id)
    }

    async fn execute(self: Arc<Self>, task_id: String, task: OrchestratorTask) {
        self.update_result(&task_id, |r| r.mark_running()).await;

        let run = async {
            let agent = self.get_or_create_agent(&task.agent).await?;
            agent.run(&task).await
        };
        let outcome: anyhow::Result<AgentResponse> =
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("agent panicked")),
            };
        self.agents.touch(&task.agent.agent_id).await;

        match outcome {
            Ok(response) => {
                let tool_calls = response.tool_calls.len();
                self.update_result(&task_id, |r| r.complete(response)).await;
                info!(task_id = %task_id, tool_calls, "Orchestrator task completed");
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(task_id = %task_id, error = %message, "Orchestrator task failed");
                self.update_result(&task_id, |r| r.fail(message)).await;
            }
        }
    }

    async fn update_result<F>(&self, task_id: &str, f: F)
    where
        F: FnOnce(&mut TaskResult) -> bool,
    {
        let mut results = self.results.write().await;
        match results.get_mut(task_id) {
            Some(result) => {
                if !f(result) {
                    debug!(task_id, status = %result.status, "Ignored out-of-order result update");
                }
            }
            None => debug!(task_id, "Result reaped before update"),
        }
    }

    /// Current result, or a `NOT_FOUND` sentinel for unknown ids.
    pub async fn get_status(&self, task_id: &str) -> TaskResult {
        self.results
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| TaskResult::not_found(task_id))
    }

    /// Results sorted oldest first, optionally restricted to one status.
    pub async fn list_tasks(&self, status: Option<TaskResultStatus>) -> Vec<TaskResult> {
        let mut results: Vec<TaskResult> = self
            .results
            .read()
            .await
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        results.sort_by_key(|r| r.created_at);
        results
    }

    /// The submitted task, if still tracked.
    pub async fn get_task(&self, task_id: &str) -> Option<OrchestratorTask> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|tracked| tracked.task.clone())
    }

    pub async fn get_or_create_agent(
        &self,
        params: &AgentParams,
    ) -> Result<Arc<dyn AgentExecutor>, OrchestratorError> {
        self.agents.get_or_create(params).await
    }

    /// Remove finished tasks older than the task TTL. Pending and running
    /// tasks are kept regardless of age.
    pub async fn cleanup_old_tasks(&self) -> usize {
        let now = Instant::now();
        let mut tasks = self.tasks.write().await;
        let mut results = self.results.write().await;

        let expired: Vec<String> = tasks
            .iter()
            .filter(|(id, tracked)| {
                now.saturating_duration_since(tracked.created_at) > self.config.task_ttl
                    && results.get(*id).is_some_and(|r| r.is_terminal())
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            tasks.remove(id);
            results.remove(id);
        }
        *self.last_cleanup.lock().await = now;

        if !expired.is_empty() {
            info!(removed = expired.len(), "Cleaned up finished orchestrator tasks");
        }
        expired.len()
    }

    /// Run `cleanup_old_tasks` if the cleanup interval has elapsed.
    pub async fn maybe_cleanup(&self) -> Option<usize> {
        {
            let last = self.last_cleanup.lock().await;
            if last.elapsed() < self.config.cleanup_interval {
                return None;
            }
        }
        Some(self.cleanup_old_tasks().await)
    }

    pub async fn evict_idle_agents(&self) -> usize {
        let evicted = self.agents.evict_idle().await;
        if evicted > 0 {
            info!(evicted, "Evicted idle agents");
        }
        evicted
    }

    pub async fn remove_agent(&self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).await
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.len().await
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let mut stats = OrchestratorStats {
            agents: self.agents.len().await,
            ..OrchestratorStats::default()
        };
        for result in self.results.read().await.values() {
            stats.tracked += 1;
            match result.status {
                TaskResultStatus::Pending => stats.pending += 1,
                TaskResultStatus::Running => stats.running += 1,
                TaskResultStatus::Completed => stats.completed += 1,
                TaskResultStatus::Failed => stats.failed += 1,
                TaskResultStatus::NotFound => {}
            }
        }
        stats
    }

    /// Periodic task cleanup and idle-agent eviction. The loop ends once the
    /// orchestrator has been dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            // `interval` panics on a zero period.
            let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    debug!("Orchestrator dropped, maintenance loop exiting");
                    break;
                };
                orchestrator.cleanup_old_tasks().await;
                orchestrator.evict_idle_agents().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::orchestrator::model::{TokenUsage, ToolCall};

    /// Echoes the prompt; a prompt of "hang" never finishes, "fail" errors.
    struct ScriptedAgent;

    #[async_trait]
    impl AgentExecutor for ScriptedAgent {
        async fn run(&self, task: &OrchestratorTask) -> anyhow::Result<AgentResponse> {
            match task.prompt.as_str() {
                "hang" => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                "fail" => anyhow::bail!("boom"),
                prompt => Ok(AgentResponse {
                    response: prompt.to_string(),
                    tool_calls: vec![ToolCall {
                        name: "echo".to_string(),
                        arguments: serde_json::json!({"text": prompt}),
                        output: None,
                    }],
                    usage: TokenUsage {
                        input_tokens: 1,
                        output_tokens: 1,
                    },
                }),
            }
        }
    }

    struct ScriptedFactory;

    #[async_trait]
    impl AgentFactory for ScriptedFactory {
        async fn create(&self, _params: &AgentParams) -> anyhow::Result<Arc<dyn AgentExecutor>> {
            Ok(Arc::new(ScriptedAgent))
        }
    }

    fn new_orchestrator(config: OrchestratorConfig) -> Arc<TaskOrchestrator> {
        TaskOrchestrator::new(config, Arc::new(ScriptedFactory))
    }

    async fn wait_terminal(orchestrator: &TaskOrchestrator, id: &str) -> TaskResult {
        for _ in 0..200 {
            let result = orchestrator.get_status(id).await;
            if result.is_terminal() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        orchestrator.get_status(id).await
    }

    #[tokio::test]
    async fn submit_runs_task_to_completion() {
        let orchestrator = new_orchestrator(OrchestratorConfig::default());
        let id = orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a1"), "hello"))
            .await
            .unwrap();

        let result = wait_terminal(&orchestrator, &id).await;
        assert_eq!(result.status, TaskResultStatus::Completed);
        assert_eq!(result.response.as_deref(), Some("hello"));
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.usage.map(|u| u.total()), Some(2));
        assert_eq!(orchestrator.agent_count().await, 1);
    }

    #[tokio::test]
    async fn agent_error_marks_failed() {
        let orchestrator = new_orchestrator(OrchestratorConfig::default());
        let id = orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a1"), "fail"))
            .await
            .unwrap();

        let result = wait_terminal(&orchestrator, &id).await;
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let orchestrator = new_orchestrator(OrchestratorConfig::default());
        let result = orchestrator.get_status("nope").await;
        assert_eq!(result.status, TaskResultStatus::NotFound);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let orchestrator = new_orchestrator(OrchestratorConfig::default());
        let task = OrchestratorTask::new(AgentParams::new("a1"), "hang").with_id("fixed");
        orchestrator.submit(task.clone()).await.unwrap();
        assert!(matches!(
            orchestrator.submit(task).await,
            Err(OrchestratorError::DuplicateTask { .. })
        ));
    }

    #[tokio::test]
    async fn capacity_drops_oldest_finished_then_refuses() {
        let orchestrator = new_orchestrator(OrchestratorConfig {
            max_tasks: 2,
            ..OrchestratorConfig::default()
        });

        let done = orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a"), "quick"))
            .await
            .unwrap();
        wait_terminal(&orchestrator, &done).await;
        orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a"), "hang"))
            .await
            .unwrap();

        // Full: the finished task makes room.
        orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a"), "hang"))
            .await
            .unwrap();
        assert_eq!(
            orchestrator.get_status(&done).await.status,
            TaskResultStatus::NotFound
        );

        // Full of unfinished work: refused.
        assert!(matches!(
            orchestrator
                .submit(OrchestratorTask::new(AgentParams::new("a"), "hang"))
                .await,
            Err(OrchestratorError::CapacityExceeded { max: 2 })
        ));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_spares_unfinished_work() {
        let orchestrator = new_orchestrator(OrchestratorConfig {
            task_ttl: Duration::from_millis(30),
            ..OrchestratorConfig::default()
        });

        let finished = orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a"), "quick"))
            .await
            .unwrap();
        let stuck = orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a"), "hang"))
            .await
            .unwrap();
        wait_terminal(&orchestrator, &finished).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(orchestrator.cleanup_old_tasks().await, 1);
        assert_eq!(orchestrator.cleanup_old_tasks().await, 0);
        assert_eq!(
            orchestrator.get_status(&finished).await.status,
            TaskResultStatus::NotFound
        );
        assert_eq!(
            orchestrator.get_status(&stuck).await.status,
            TaskResultStatus::Running
        );
        assert!(orchestrator.get_task(&stuck).await.is_some());
    }

    #[tokio::test]
    async fn maybe_cleanup_is_rate_limited() {
        let orchestrator = new_orchestrator(OrchestratorConfig {
            cleanup_interval: Duration::from_secs(3600),
            ..OrchestratorConfig::default()
        });
        assert_eq!(orchestrator.maybe_cleanup().await, None);

        let eager = new_orchestrator(OrchestratorConfig {
            cleanup_interval: Duration::ZERO,
            ..OrchestratorConfig::default()
        });
        assert_eq!(eager.maybe_cleanup().await, Some(0));
    }

    #[tokio::test]
    async fn stats_and_listing() {
        let orchestrator = new_orchestrator(OrchestratorConfig::default());
        let done = orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("a"), "quick"))
            .await
            .unwrap();
        wait_terminal(&orchestrator, &done).await;
        orchestrator
            .submit(OrchestratorTask::new(AgentParams::new("b"), "fail"))
            .await
            .unwrap();

        let completed = orchestrator
            .list_tasks(Some(TaskResultStatus::Completed))
            .await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].task_id, done);
        assert_eq!(orchestrator.list_tasks(None).await.len(), 2);

        let stats = orchestrator.stats().await;
        assert_eq!(stats.tracked, 2);
        assert_eq!(stats.completed, 1);
        assert!(orchestrator.remove_agent("a").await);
        assert!(!orchestrator.remove_agent("a").await);
    }
}
