//! Worker agent descriptors and the registry the scheduler resolves
//! `agentId` values against.

use crate::constants::AGENT_CHAT_PATH;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// An external HTTP server that accepts a chat request and streams back
/// newline-delimited JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAgent {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base URL, e.g. `http://agent-1:8080`.
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl WorkerAgent {
    /// Full URL of the agent's chat endpoint.
    pub fn chat_url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), AGENT_CHAT_PATH)
    }
}

/// Registry of dispatchable worker agents, seeded from configuration.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, WorkerAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_agents(agents: Vec<WorkerAgent>) -> Self {
        let registry = Self::new();
        for agent in agents {
            registry.register(agent);
        }
        registry
    }

    /// Insert or replace an agent descriptor.
    pub fn register(&self, agent: WorkerAgent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn get(&self, agent_id: &str) -> Option<WorkerAgent> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<WorkerAgent> {
        let mut agents: Vec<WorkerAgent> = self
            .agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, endpoint: &str) -> WorkerAgent {
        WorkerAgent {
            id: id.to_string(),
            name: None,
            endpoint: endpoint.to_string(),
            working_directory: None,
        }
    }

    #[test]
    fn chat_url_handles_trailing_slash() {
        assert_eq!(
            agent("a1", "http://localhost:9000/").chat_url(),
            "http://localhost:9000/api/chat"
        );
        assert_eq!(
            agent("a1", "http://localhost:9000").chat_url(),
            "http://localhost:9000/api/chat"
        );
    }

    #[test]
    fn registry_lookup_and_listing() {
        let registry = AgentRegistry::from_agents(vec![
            agent("beta", "http://b"),
            agent("alpha", "http://a"),
        ]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("alpha").unwrap().endpoint, "http://a");
        assert!(registry.get("gamma").is_none());

        let ids: Vec<String> = registry.list().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
