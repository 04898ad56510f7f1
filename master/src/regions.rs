//! Region index over registered spawners.

use shared::{AgentId, RegionInfo};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct RegionDirectory {
    /// Representative addresses supplied by configuration
    addresses: BTreeMap<String, String>,
    members: BTreeMap<String, BTreeSet<AgentId>>,
}

impl RegionDirectory {
    pub fn new(addresses: BTreeMap<String, String>) -> Self {
        Self {
            addresses,
            members: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, region: &str, agent_id: AgentId) {
        self.members
            .entry(region.to_string())
            .or_default()
            .insert(agent_id);
    }

    pub fn remove(&mut self, region: &str, agent_id: AgentId) {
        if let Some(agents) = self.members.get_mut(region) {
            agents.remove(&agent_id);
            if agents.is_empty() {
                self.members.remove(region);
            }
        }
    }

    /// Agents registered under `region`, in registration order.
    pub fn agents_in(&self, region: &str) -> Option<&BTreeSet<AgentId>> {
        self.members.get(region)
    }

    /// One entry per known region. `free_slots` is looked up per agent.
    pub fn summaries(&self, free_slots: impl Fn(AgentId) -> u32) -> Vec<RegionInfo> {
        let names: BTreeSet<&String> = self.addresses.keys().chain(self.members.keys()).collect();

        names
            .into_iter()
            .map(|name| {
                let agents = self.members.get(name);
                RegionInfo {
                    name: name.clone(),
                    address: self.addresses.get(name).cloned(),
                    agents: agents.map_or(0, |a| a.len() as u32),
                    free_slots: agents.map_or(0, |a| a.iter().map(|id| free_slots(*id)).sum()),
                }
            })
            .collect()
    }
}
