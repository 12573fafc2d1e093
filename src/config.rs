//! Configuration types.
//!
//! Every section has sensible defaults and can be overridden from
//! `AGENT_TASKS_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently executing tasks in this process.
    pub pool_size: usize,
    /// Sleep between poll cycles.
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll sleep.
    pub poll_jitter: Duration,
    /// How many of the lowest-scored pending ids a claim attempt considers.
    pub claim_candidates: usize,
    /// Partitions served by the background pool.
    pub partitions: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
            claim_candidates: 10,
            partitions: vec!["background".to_string()],
        }
    }
}

impl PoolConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Build config from an arbitrary key lookup (used by `from_env`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let pool_size: usize = parse_or(&lookup, "AGENT_TASKS_POOL_SIZE", defaults.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_TASKS_POOL_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let partitions = lookup("AGENT_TASKS_PARTITIONS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.partitions);

        Ok(Self {
            pool_size,
            poll_interval: millis_or(&lookup, "AGENT_TASKS_POLL_INTERVAL_MS", defaults.poll_interval)?,
            poll_jitter: millis_or(&lookup, "AGENT_TASKS_POLL_JITTER_MS", defaults.poll_jitter)?,
            claim_candidates: parse_or(
                &lookup,
                "AGENT_TASKS_CLAIM_CANDIDATES",
                defaults.claim_candidates,
            )?
            .max(1),
            partitions,
        })
    }
}

/// Task record retention in the shared store.
#[derive(Debug, Clone)]
pub struct RecordConfig {
    /// TTL for pending and running records.
    pub record_ttl_active: Duration,
    /// TTL for completed and failed records.
    pub record_ttl_terminal: Duration,
    /// Length of the per-partition completed history list.
    pub history_limit: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            record_ttl_active: Duration::from_secs(6 * 3600),
            record_ttl_terminal: Duration::from_secs(15 * 60),
            history_limit: 100,
        }
    }
}

impl RecordConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            record_ttl_active: secs_or(
                &lookup,
                "AGENT_TASKS_RECORD_TTL_ACTIVE_SECS",
                defaults.record_ttl_active,
            )?,
            record_ttl_terminal: secs_or(
                &lookup,
                "AGENT_TASKS_RECORD_TTL_TERMINAL_SECS",
                defaults.record_ttl_terminal,
            )?,
            history_limit: parse_or(&lookup, "AGENT_TASKS_HISTORY_LIMIT", defaults.history_limit)?,
        })
    }
}

/// In-process orchestrator limits.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum tracked tasks before submissions are refused.
    pub max_tasks: usize,
    /// Age after which terminal task entries are dropped.
    pub task_ttl: Duration,
    /// Minimum spacing between opportunistic cleanup passes.
    pub cleanup_interval: Duration,
    /// Maximum cached agents.
    pub max_agents: usize,
    /// Idle time after which a cached agent is evicted.
    pub agent_idle_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tasks: 1000,
            task_ttl: Duration::from_secs(3600),      // 1 hour
            cleanup_interval: Duration::from_secs(60), // 1 minute
            max_agents: 50,
            agent_idle_ttl: Duration::from_secs(1800), // 30 minutes
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_tasks: parse_or(&lookup, "AGENT_TASKS_MAX_TASKS", defaults.max_tasks)?,
            task_ttl: secs_or(&lookup, "AGENT_TASKS_TASK_TTL_SECS", defaults.task_ttl)?,
            cleanup_interval: secs_or(
                &lookup,
                "AGENT_TASKS_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            )?,
            max_agents: parse_or(&lookup, "AGENT_TASKS_MAX_AGENTS", defaults.max_agents)?,
            agent_idle_ttl: secs_or(
                &lookup,
                "AGENT_TASKS_AGENT_IDLE_TTL_SECS",
                defaults.agent_idle_ttl,
            )?,
        })
    }
}

/// Shared store connection settings.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Redis URL. When absent the in-memory store is used.
    pub redis_url: Option<SecretString>,
    /// Namespace prepended to every key and channel.
    pub key_prefix: String,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            redis_url: lookup("AGENT_TASKS_REDIS_URL")
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            key_prefix: lookup("AGENT_TASKS_KEY_PREFIX").unwrap_or_default(),
        }
    }
}

/// All configuration for one process.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub records: RecordConfig,
    pub orchestrator: OrchestratorConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pool: PoolConfig::from_env()?,
            records: RecordConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
            store: StoreConfig::from_env(),
        })
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}
