//! Read-only registry of configured agents, loaded once at startup.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::agent::AgentSpec;
use crate::domain::error::BridgeError;

#[derive(Debug, Deserialize)]
struct AgentsConfig {
    agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// Loads the registry from the agents JSON document at `path`.
    ///
    /// # Errors
    /// Returns [`BridgeError::ConfigError`] if the file can't be read or
    /// doesn't parse.
    pub async fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| BridgeError::ConfigError(format!("failed to read agents config: {err}")))?;

        Self::from_json(&raw)
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self, BridgeError> {
        let parsed: AgentsConfig = serde_json::from_str(raw)
            .map_err(|err| BridgeError::ConfigError(format!("failed to parse agents config: {err}")))?;

        let agents = parsed
            .agents
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        Ok(Self { agents })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.values()
    }
}
