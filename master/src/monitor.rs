//! Read-only view of the orchestrator for dashboards and admin tooling.

use crate::agents::AgentSnapshot;
use crate::orchestrator::Orchestrator;
use crate::rooms::RoomSnapshot;
use crate::task::TaskSnapshot;
use serde::Serialize;
use shared::{RegionInfo, SpawnStatus};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Headline numbers for a status page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub agents: usize,
    pub free_slots: u32,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub rooms: usize,
}

/// Cloneable handle that only takes read locks.
#[derive(Clone)]
pub struct Monitor {
    orchestrator: Arc<RwLock<Orchestrator>>,
}

impl Monitor {
    pub fn new(orchestrator: Arc<RwLock<Orchestrator>>) -> Self {
        Self { orchestrator }
    }

    pub async fn agents(&self) -> Vec<AgentSnapshot> {
        self.orchestrator.read().await.agents().snapshot()
    }

    pub async fn tasks(&self) -> Vec<TaskSnapshot> {
        self.orchestrator.read().await.scheduler().snapshot()
    }

    pub async fn rooms(&self) -> Vec<RoomSnapshot> {
        self.orchestrator.read().await.rooms().snapshot()
    }

    pub async fn regions(&self) -> Vec<RegionInfo> {
        self.orchestrator.read().await.regions()
    }

    pub async fn summary(&self) -> MonitorSummary {
        let orchestrator = self.orchestrator.read().await;
        let agents = orchestrator.agents();
        let scheduler = orchestrator.scheduler();

        let running = SpawnStatus::ProcessStarted.to_string();
        let registered = SpawnStatus::ProcessRegistered.to_string();
        let running_tasks = scheduler
            .snapshot()
            .iter()
            .filter(|task| task.status == running || task.status == registered)
            .count();

        MonitorSummary {
            agents: agents.len(),
            free_slots: agents.iter().map(|agent| agent.free_slots()).sum(),
            queued_tasks: scheduler.queued().len(),
            running_tasks,
            rooms: orchestrator.rooms().len(),
        }
    }
}
