//! Copy-on-write registry of agent configurations.
//!
//! Config updates are orders of magnitude rarer than reads, so writers clone
//! the whole map and atomically publish a new snapshot. A dispatcher grabs
//! the snapshot pointer once per auction and never observes a partial update.

use model::{
    agent::{AgentConfig, InvalidConfig},
    ids::AgentId,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type Snapshot = HashMap<AgentId, Arc<AgentConfig>>;

#[derive(Clone, Default)]
pub struct Registry {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and publishes a configuration under the given agent name.
    /// An empty round robin group defaults to the agent's own name, so an
    /// agent that doesn't opt into load balancing forms its own group.
    pub fn register(&self, agent: AgentId, mut config: AgentConfig) -> Result<(), InvalidConfig> {
        config.validate()?;
        if config.round_robin_group.is_empty() {
            config.round_robin_group = agent.as_str().to_owned();
        }
        self.publish(|snapshot| {
            snapshot.insert(agent.clone(), Arc::new(config));
        });
        Ok(())
    }

    pub fn unregister(&self, agent: &AgentId) -> bool {
        let mut removed = false;
        self.publish(|snapshot| {
            removed = snapshot.remove(agent).is_some();
        });
        removed
    }

    pub fn lookup(&self, agent: &AgentId) -> Option<Arc<AgentConfig>> {
        self.snapshot().get(agent).cloned()
    }

    /// The current immutable snapshot of all configurations.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn publish(&self, mutate: impl FnOnce(&mut Snapshot)) {
        let mut guard = self.current.write().unwrap();
        let mut next = Snapshot::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        serde_json::from_value(serde_json::json!({
            "account": "campaign:a",
            "creatives": [{"id": 1, "format": {"width": 728, "height": 90}}]
        }))
        .unwrap()
    }

    #[test]
    fn snapshots_are_immutable() {
        let registry = Registry::new();
        registry.register("alpha".into(), config()).unwrap();

        let before = registry.snapshot();
        registry.register("beta".into(), config()).unwrap();
        let after = registry.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert!(registry.unregister(&"alpha".into()));
        assert!(!registry.unregister(&"alpha".into()));
        // Older snapshots keep the world they were taken in.
        assert!(after.contains_key(&AgentId::from("alpha")));
    }

    #[test]
    fn empty_round_robin_group_defaults_to_agent_name() {
        let registry = Registry::new();
        registry.register("alpha".into(), config()).unwrap();
        let published = registry.lookup(&"alpha".into()).unwrap();
        assert_eq!(published.round_robin_group, "alpha");

        let mut grouped = config();
        grouped.round_robin_group = "g1".to_owned();
        registry.register("beta".into(), grouped).unwrap();
        assert_eq!(
            registry.lookup(&"beta".into()).unwrap().round_robin_group,
            "g1"
        );
    }

    #[test]
    fn rejects_invalid_configs() {
        let registry = Registry::new();
        let mut bad = config();
        bad.bid_probability = 2.0;
        assert!(registry.register("alpha".into(), bad).is_err());
        assert!(registry.is_empty());
    }
}
