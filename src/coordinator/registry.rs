//! Agent registry and groups

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::state::{AgentSnapshot, AgentState};
use crate::agents::{AgentKind, SignalAgent};
use crate::error::{PaceError, Result};

/// Named collection of agents sharing one responsibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentGroup {
    pub id: String,
    pub responsibility: String,
    pub agent_ids: Vec<String>,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentState>,
    groups: BTreeMap<String, AgentGroup>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One agent of each built-in kind, in its default group
    pub fn with_builtin_agents() -> Self {
        let mut registry = Self::new();
        for (kind, id) in [
            (AgentKind::Momentum, "momentum-1"),
            (AgentKind::MeanReversion, "mean-reversion-1"),
            (AgentKind::VolumeBreakout, "volume-breakout-1"),
        ] {
            // ids are distinct, registration cannot collide
            let _ = registry.register(kind.build(id), kind.default_group());
        }
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn SignalAgent>, group_id: &str) -> Result<()> {
        let agent_id = agent.id().to_string();
        if self.agents.contains_key(&agent_id) {
            return Err(PaceError::Configuration(format!(
                "duplicate agent id: {agent_id}"
            )));
        }
        let responsibility = agent.kind().to_string();
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| AgentGroup {
                id: group_id.to_string(),
                responsibility,
                agent_ids: Vec::new(),
            })
            .agent_ids
            .push(agent_id.clone());
        self.agents
            .insert(agent_id, AgentState::new(agent, group_id));
        Ok(())
    }

    pub fn set_active(&mut self, agent_id: &str, active: bool) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(state) => {
                state.active = active;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    pub fn get_mut(&mut self, agent_id: &str) -> Option<&mut AgentState> {
        self.agents.get_mut(agent_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &AgentGroup> {
        self.groups.values()
    }

    /// Active agents of a group, in registration order
    pub fn active_agents(&self, group_id: &str) -> Vec<Arc<dyn SignalAgent>> {
        self.groups
            .get(group_id)
            .map(|group| {
                group
                    .agent_ids
                    .iter()
                    .filter_map(|id| self.agents.get(id))
                    .filter(|state| state.active)
                    .map(|state| state.agent.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents.values().map(AgentState::snapshot).collect()
    }

    pub fn agents_mut(&mut self) -> impl Iterator<Item = &mut AgentState> {
        self.agents.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_groups() {
        let registry = AgentRegistry::with_builtin_agents();
        assert_eq!(registry.len(), 3);
        let groups: Vec<&str> = registry.groups().map(|g| g.id.as_str()).collect();
        assert_eq!(groups, vec!["flow", "reversion", "trend"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = AgentRegistry::new();
        registry
            .register(AgentKind::Momentum.build("a"), "trend")
            .unwrap();
        assert!(registry
            .register(AgentKind::MeanReversion.build("a"), "reversion")
            .is_err());
    }

    #[test]
    fn test_inactive_agents_not_dispatched() {
        let mut registry = AgentRegistry::with_builtin_agents();
        assert_eq!(registry.active_agents("trend").len(), 1);
        assert!(registry.set_active("momentum-1", false));
        assert!(registry.active_agents("trend").is_empty());
        assert!(!registry.set_active("missing", false));
    }
}
