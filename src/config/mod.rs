use crate::{
    agents::WorkerAgent,
    constants::{
        DEFAULT_MAX_CONCURRENCY, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY_MS,
        DEFAULT_TASK_TIMEOUT_MS,
    },
    models::QueueSettings,
    Result,
};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub agents: AgentsConfig,
    /// Verbose logging when set.
    pub debug_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; empty selects the in-memory fallback.
    pub endpoint: String,
    /// When set, an unreachable backend at startup is fatal instead of
    /// degrading to the in-memory fallback.
    pub require_store: bool,
}

/// Process-wide defaults applied to queues created without explicit
/// settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub timeout_per_task_ms: u64,
}

impl SchedulerConfig {
    pub fn default_queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrency: self.max_concurrency,
            retry_count: self.retry_count,
            retry_delay: self.retry_delay_ms,
            timeout_per_task: self.timeout_per_task_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Worker agents dispatchable by `agentId`.
    pub agents: Vec<WorkerAgent>,
    /// Opaque credential blob forwarded to agents with every chat
    /// request. The engine never inspects it.
    pub credentials: Option<serde_json::Value>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let api = ApiConfig {
            host: env::var("CONDUCTOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("CONDUCTOR_PORT", 8420),
        };

        let store = StoreConfig {
            endpoint: env::var("CONDUCTOR_STORE_URL").unwrap_or_default(),
            require_store: parse_bool_env("CONDUCTOR_REQUIRE_STORE"),
        };

        let scheduler = SchedulerConfig {
            max_concurrency: parse_env("CONDUCTOR_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY),
            retry_count: parse_env("CONDUCTOR_RETRY_COUNT", DEFAULT_RETRY_COUNT),
            retry_delay_ms: parse_env("CONDUCTOR_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS),
            timeout_per_task_ms: parse_env("CONDUCTOR_TASK_TIMEOUT_MS", DEFAULT_TASK_TIMEOUT_MS),
        };

        let agents = AgentsConfig {
            agents: match env::var("CONDUCTOR_AGENTS") {
                Ok(raw) if !raw.trim().is_empty() => parse_agents(&raw)?,
                _ => Vec::new(),
            },
            credentials: match env::var("CONDUCTOR_AGENT_CREDENTIALS") {
                Ok(raw) if !raw.trim().is_empty() => Some(parse_credentials(&raw)?),
                _ => None,
            },
        };

        if agents.agents.is_empty() {
            tracing::warn!("No worker agents configured; dispatches will fail agent lookup");
        }

        Ok(Config {
            api,
            store,
            scheduler,
            agents,
            debug_mode: parse_bool_env("CONDUCTOR_DEBUG"),
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Parse the `CONDUCTOR_AGENTS` JSON array of worker agent descriptors.
fn parse_agents(raw: &str) -> Result<Vec<WorkerAgent>> {
    let agents: Vec<WorkerAgent> = serde_json::from_str(raw).map_err(|e| {
        crate::ConductorError::ConfigurationError(format!("CONDUCTOR_AGENTS is not valid JSON: {e}"))
    })?;

    for agent in &agents {
        if agent.id.trim().is_empty() {
            return Err(crate::ConductorError::ConfigurationError(
                "CONDUCTOR_AGENTS entry has an empty id".to_string(),
            ));
        }
        if !agent.endpoint.starts_with("http://") && !agent.endpoint.starts_with("https://") {
            return Err(crate::ConductorError::ConfigurationError(format!(
                "Agent '{}' endpoint must be an http(s) URL",
                agent.id
            )));
        }
    }

    Ok(agents)
}

fn parse_credentials(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| {
        crate::ConductorError::ConfigurationError(format!(
            "CONDUCTOR_AGENT_CREDENTIALS is not valid JSON: {e}"
        ))
    })
}
