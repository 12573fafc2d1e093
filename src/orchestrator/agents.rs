//! Agent cache: reusable stateful executors keyed by agent id.
//!
//! Entries are built lazily through an `AgentFactory`, reused while the
//! session matches, and evicted when idle longer than the idle TTL or when
//! the cache grows past its capacity (least recently active first).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::OrchestratorError;
use crate::orchestrator::model::{AgentParams, AgentResponse, OrchestratorTask};

/// A live agent able to run orchestrator tasks.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, task: &OrchestratorTask) -> anyhow::Result<AgentResponse>;
}

/// Builds agents on a cache miss.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, params: &AgentParams) -> anyhow::Result<Arc<dyn AgentExecutor>>;
}

/// One cache entry.
#[derive(Clone)]
pub struct CachedAgent {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub executor: Arc<dyn AgentExecutor>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl CachedAgent {
    fn is_idle(&self, now: Instant, idle_ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > idle_ttl
    }
}

pub struct AgentCache {
    agents: RwLock<HashMap<String, CachedAgent>>,
    factory: Arc<dyn AgentFactory>,
    max_agents: usize,
    idle_ttl: Duration,
}

impl AgentCache {
    pub fn new(factory: Arc<dyn AgentFactory>, max_agents: usize, idle_ttl: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            factory,
            max_agents: max_agents.max(1),
            idle_ttl,
        }
    }

    /// Return the cached agent for `params.agent_id` when it was built for
    /// the same session and has not idled past the TTL, otherwise build and
    /// cache a fresh one.
    pub async fn get_or_create(
        &self,
        params: &AgentParams,
    ) -> Result<Arc<dyn AgentExecutor>, OrchestratorError> {
        {
            let mut agents = self.agents.write().await;
            let now = Instant::now();
            if let Some(entry) = agents.get_mut(&params.agent_id)
                && entry.session_id == params.session_id
                && !entry.is_idle(now, self.idle_ttl)
            {
                entry.last_activity = now;
                return Ok(Arc::clone(&entry.executor));
            }
        }

        // Built outside the lock; creation may be slow.
        let executor = self.factory.create(params).await.map_err(|e| {
            OrchestratorError::AgentCreation {
                agent_id: params.agent_id.clone(),
                reason: format!("{e:#}"),
            }
        })?;

        let now = Instant::now();
        let mut agents = self.agents.write().await;
        let replaced = agents
            .insert(
                params.agent_id.clone(),
                CachedAgent {
                    agent_id: params.agent_id.clone(),
                    session_id: params.session_id.clone(),
                    executor: Arc::clone(&executor),
                    created_at: now,
                    last_activity: now,
                },
            )
            .is_some();
        info!(
            agent_id = %params.agent_id,
            session_id = ?params.session_id,
            replaced,
            "Created agent"
        );

        Self::evict_idle_locked(&mut agents, now, self.idle_ttl);
        Self::evict_over_capacity_locked(&mut agents, self.max_agents);
        Ok(executor)
    }

    /// Stamp activity on an agent, e.g. after a run finishes.
    pub async fn touch(&self, agent_id: &str) {
        if let Some(entry) = self.agents.write().await.get_mut(agent_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Drop every agent idle longer than the idle TTL.
    pub async fn evict_idle(&self) -> usize {
        let mut agents = self.agents.write().await;
        Self::evict_idle_locked(&mut agents, Instant::now(), self.idle_ttl)
    }

    pub async fn remove(&self, agent_id: &str) -> bool {
        self.agents.write().await.remove(agent_id).is_some()
    }

    pub async fn get(&self, agent_id: &str) -> Option<CachedAgent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    fn evict_idle_locked(
        agents: &mut HashMap<String, CachedAgent>,
        now: Instant,
        idle_ttl: Duration,
    ) -> usize {
        let before = agents.len();
        agents.retain(|agent_id, entry| {
            let keep = !entry.is_idle(now, idle_ttl);
            if !keep {
                debug!(agent_id = %agent_id, "Evicting idle agent");
            }
            keep
        });
        before - agents.len()
    }

    fn evict_over_capacity_locked(
        agents: &mut HashMap<String, CachedAgent>,
        max_agents: usize,
    ) -> usize {
        let mut evicted = 0;
        while agents.len() > max_agents {
            let Some(oldest) = agents
                .values()
                .min_by_key(|entry| entry.last_activity)
                .map(|entry| entry.agent_id.clone())
            else {
                break;
            };
            agents.remove(&oldest);
            debug!(agent_id = %oldest, "Evicting least recently active agent");
            evicted += 1;
        }
        evicted
    }
}
