use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// What the coordination core knows about an agent: identity plus declared
/// capabilities. Resolution of capabilities to behavior lives with the
/// agents themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// Resolves agent identifiers. The handoff manager uses this only to
/// validate handoff targets.
pub trait AgentRegistry: Send + Sync {
    fn get_agent(&self, agent_id: &str) -> Option<AgentDescriptor>;
}

#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<String, AgentDescriptor>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        let mut agents = self.agents.write();
        if agents.contains_key(&descriptor.id) {
            return Err(FlowError::Other(format!(
                "Agent with ID '{}' already registered",
                descriptor.id
            )));
        }
        agents.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.agents.write().remove(agent_id).is_some()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn count(&self) -> usize {
        self.agents.read().len()
    }

    pub fn clear(&self) {
        self.agents.write().clear();
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn get_agent(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.agents.read().get(agent_id).cloned()
    }
}
