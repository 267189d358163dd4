//! Name-addressed view of an agent hierarchy.

use std::collections::HashMap;
use std::sync::Arc;

use super::Agent;
use crate::error::{Result, TroupeError};

/// Arena of agents indexed by name, with parent back-links.
///
/// Ownership stays with the agents themselves (each owns its sub-agents);
/// the tree only answers lookups.
#[derive(Debug)]
pub struct AgentTree {
    root: Arc<dyn Agent>,
    agents: HashMap<String, Arc<dyn Agent>>,
    parents: HashMap<String, String>,
}

impl AgentTree {
    /// Index `root` and its descendants. Agent names must be unique.
    pub fn new(root: Arc<dyn Agent>) -> Result<Self> {
        let mut tree = Self {
            root: Arc::clone(&root),
            agents: HashMap::new(),
            parents: HashMap::new(),
        };
        tree.insert(root, None)?;
        Ok(tree)
    }

    fn insert(&mut self, agent: Arc<dyn Agent>, parent: Option<&str>) -> Result<()> {
        let name = agent.name().to_string();
        if name.is_empty() {
            return Err(TroupeError::Configuration("agent name must not be empty".into()));
        }
        if self.agents.contains_key(&name) {
            return Err(TroupeError::Configuration(format!(
                "agent name '{name}' is used more than once in the agent tree"
            )));
        }
        if let Some(parent) = parent {
            self.parents.insert(name.clone(), parent.to_string());
        }
        self.agents.insert(name.clone(), Arc::clone(&agent));
        for sub in agent.sub_agents() {
            self.insert(Arc::clone(sub), Some(&name))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Arc<dyn Agent> {
        &self.root
    }

    pub fn find_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn parent_of(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.parents
            .get(name)
            .and_then(|parent| self.agents.get(parent))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Whether control can be routed to `name` from anywhere in the tree:
    /// neither it nor any ancestor below the root blocks transfer to its parent.
    pub fn is_transferable(&self, name: &str) -> bool {
        let mut current = name;
        loop {
            let Some(agent) = self.agents.get(current) else {
                return false;
            };
            let Some(parent) = self.parents.get(current) else {
                return true;
            };
            if agent.disallow_transfer_to_parent() {
                return false;
            }
            current = parent;
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
