//! Registry of connected spawner agents
//!
//! Tracks, per worker host:
//! - Declared capacity and the last reported running-process count
//! - Slots reserved by launch offers that the agent has not acknowledged yet
//! - Region label and capability tags used by placement
//!
//! The registry is the only owner of agent records. Placement reads it,
//! but every count change goes through the methods below so that
//! `running <= max` holds no matter in which order reports arrive.

use crate::error::{OrchestratorError, Result};
use crate::regions::RegionDirectory;
use log::{debug, info};
use serde::Serialize;
use shared::{AgentId, PeerId, Properties, RegionInfo, SpawnerInfo};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SpawnerAgent {
    pub id: AgentId,
    pub peer_id: PeerId,
    pub region: String,
    pub max_processes: u32,
    pub running_processes: u32,
    /// Launch offers sent but not yet acknowledged
    pub reserved: u32,
    pub capabilities: Properties,
    pub registered_at: Instant,
    /// Timestamp of the last capacity report that was applied
    last_report: Option<u64>,
}

impl SpawnerAgent {
    /// Slots available for new offers. Never negative.
    pub fn free_slots(&self) -> u32 {
        self.max_processes
            .saturating_sub(self.running_processes)
            .saturating_sub(self.reserved)
    }

    /// True if every required capability is declared with the same value.
    pub fn has_capabilities(&self, required: &Properties) -> bool {
        required
            .iter()
            .all(|(key, value)| self.capabilities.get(key) == Some(value))
    }
}

/// Read-only view handed to monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub peer_id: PeerId,
    pub region: String,
    pub max_processes: u32,
    pub running_processes: u32,
    pub reserved: u32,
    pub free_slots: u32,
    pub capabilities: BTreeMap<String, String>,
    pub uptime_secs: u64,
}

pub struct AgentRegistry {
    agents: HashMap<AgentId, SpawnerAgent>,
    by_peer: HashMap<PeerId, AgentId>,
    regions: RegionDirectory,
    next_agent_id: AgentId,
    default_max_processes: u32,
}

impl AgentRegistry {
    pub fn new(default_max_processes: u32, regions: RegionDirectory) -> Self {
        Self {
            agents: HashMap::new(),
            by_peer: HashMap::new(),
            regions,
            next_agent_id: 1,
            default_max_processes,
        }
    }

    /// Registers the spawner behind `peer_id`.
    ///
    /// Agent IDs grow monotonically, so a lower ID always means an earlier
    /// registration; placement relies on that for tie-breaking.
    pub fn register(&mut self, peer_id: PeerId, info: SpawnerInfo) -> Result<AgentId> {
        if self.by_peer.contains_key(&peer_id) {
            return Err(OrchestratorError::DuplicateRegistration(peer_id));
        }

        let id = self.next_agent_id;
        self.next_agent_id += 1;

        let max_processes = if info.max_processes == 0 {
            self.default_max_processes
        } else {
            info.max_processes
        };

        let agent = SpawnerAgent {
            id,
            peer_id,
            region: info.region,
            max_processes,
            running_processes: 0,
            reserved: 0,
            capabilities: info.capabilities,
            registered_at: Instant::now(),
            last_report: None,
        };

        info!(
            "Spawner {} registered by peer {} (region '{}', {} slots)",
            id, peer_id, agent.region, max_processes
        );
        self.regions.insert(&agent.region, id);
        self.by_peer.insert(peer_id, id);
        self.agents.insert(id, agent);
        Ok(id)
    }

    pub fn unregister(&mut self, agent_id: AgentId) -> Option<SpawnerAgent> {
        let agent = self.agents.remove(&agent_id)?;
        self.by_peer.remove(&agent.peer_id);
        self.regions.remove(&agent.region, agent_id);
        info!("Spawner {} unregistered", agent_id);
        Some(agent)
    }

    /// Applies a running-process report.
    ///
    /// Reports can arrive out of order. A report older than the last
    /// applied report or acknowledged start is dropped; any other report
    /// becomes the agent's count. Returns whether the count changed.
    pub fn report_capacity(&mut self, agent_id: AgentId, running: u32, timestamp: u64) -> Result<bool> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(OrchestratorError::UnknownAgent(agent_id))?;

        if agent.last_report.is_some_and(|last| timestamp < last) {
            debug!(
                "Ignoring stale capacity report from spawner {} ({} < {:?})",
                agent_id, timestamp, agent.last_report
            );
            return Ok(false);
        }
        agent.last_report = Some(timestamp);

        let running = running.min(agent.max_processes);
        if running == agent.running_processes {
            return Ok(false);
        }
        debug!(
            "Spawner {} running {} -> {}",
            agent_id, agent.running_processes, running
        );
        agent.running_processes = running;
        Ok(true)
    }

    pub fn free_slots(&self, agent_id: AgentId) -> Result<u32> {
        self.agents
            .get(&agent_id)
            .map(SpawnerAgent::free_slots)
            .ok_or(OrchestratorError::UnknownAgent(agent_id))
    }

    /// Holds a slot for an outstanding launch offer.
    pub fn reserve(&mut self, agent_id: AgentId) -> bool {
        match self.agents.get_mut(&agent_id) {
            Some(agent) if agent.free_slots() > 0 => {
                agent.reserved += 1;
                true
            }
            _ => false,
        }
    }

    /// Gives back a slot held by an offer that was declined or withdrawn.
    pub fn release(&mut self, agent_id: AgentId) {
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.reserved = agent.reserved.saturating_sub(1);
        }
    }

    /// Turns a reservation into a running process once the agent acknowledges.
    ///
    /// A report taken after `started_at` already counts the process, so the
    /// count is only raised when no such report was applied.
    pub fn confirm_start(&mut self, agent_id: AgentId, started_at: u64) {
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.reserved = agent.reserved.saturating_sub(1);
            if agent.last_report.is_some_and(|last| last > started_at) {
                debug!("Start on spawner {} already reported", agent_id);
                return;
            }
            agent.running_processes = (agent.running_processes + 1).min(agent.max_processes);
            agent.last_report = Some(started_at);
        }
    }

    pub fn get(&self, agent_id: AgentId) -> Option<&SpawnerAgent> {
        self.agents.get(&agent_id)
    }

    pub fn find_by_peer(&self, peer_id: PeerId) -> Option<AgentId> {
        self.by_peer.get(&peer_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpawnerAgent> {
        self.agents.values()
    }

    /// Agents of `region`, in registration order.
    pub fn in_region(&self, region: &str) -> Vec<&SpawnerAgent> {
        self.regions
            .agents_in(region)
            .map(|ids| ids.iter().filter_map(|id| self.agents.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .summaries(|id| self.agents.get(&id).map_or(0, SpawnerAgent::free_slots))
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<AgentSnapshot> = self
            .agents
            .values()
            .map(|agent| AgentSnapshot {
                id: agent.id,
                peer_id: agent.peer_id,
                region: agent.region.clone(),
                max_processes: agent.max_processes,
                running_processes: agent.running_processes,
                reserved: agent.reserved,
                free_slots: agent.free_slots(),
                capabilities: agent
                    .capabilities
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                uptime_secs: agent.registered_at.elapsed().as_secs(),
            })
            .collect();
        agents.sort_by_key(|agent| agent.id);
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
