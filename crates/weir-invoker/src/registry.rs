use std::collections::HashMap;

use futures::future::BoxFuture;

use weir_core::error::{Result, WeirError};
use weir_core::traits::AgentRegistry;
use weir_core::types::AgentSpec;

/// Agent registry backed by the `[agents]` table of the config file.
pub struct ConfigAgentRegistry {
    agents: HashMap<String, AgentSpec>,
}

impl ConfigAgentRegistry {
    pub fn new(agents: HashMap<String, AgentSpec>) -> Self {
        Self { agents }
    }
}

impl AgentRegistry for ConfigAgentRegistry {
    fn get(&self, agent_ref: &str) -> BoxFuture<'_, Result<AgentSpec>> {
        let found = self.agents.get(agent_ref).cloned();
        let agent_ref = agent_ref.to_string();
        Box::pin(async move { found.ok_or(WeirError::UnknownAgent(agent_ref)) })
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }
}
