//! A single spawn request and its lifecycle.
//!
//! Status changes go through [`SpawnTask::transition`], which enforces the
//! state machine defined by [`SpawnStatus::can_transition_to`]. The
//! security code never leaves this struct except through
//! [`SpawnTask::code_for_agent`], used when building the launch offer.

use crate::auth::{constant_time_eq, generate_secret, Requester};
use crate::error::{OrchestratorError, Result};
use serde::Serialize;
use shared::{
    AgentId, FinalizationData, PeerId, Properties, RoomId, SpawnStatus, TaskId, CAPABILITY_PREFIX,
    OPT_REGION,
};
use std::time::{Duration, Instant};

const SECURITY_CODE_LEN: usize = 24;

pub struct SpawnTask {
    pub id: TaskId,
    pub requester: Requester,
    pub options: Properties,
    status: SpawnStatus,
    code: String,
    /// Agent the task was placed on; set once, on acknowledgment
    assigned_agent: Option<AgentId>,
    /// Outstanding offer awaiting acknowledgment
    offer: Option<(AgentId, Instant)>,
    /// Peer of the spawned process once it registered
    process_peer: Option<PeerId>,
    finalization: Option<FinalizationData>,
    room_id: Option<RoomId>,
    pub submitted_at: Instant,
    finished_at: Option<Instant>,
}

impl SpawnTask {
    pub fn new(id: TaskId, requester: Requester, options: Properties) -> Self {
        Self {
            id,
            requester,
            options,
            status: SpawnStatus::None,
            code: generate_secret(SECURITY_CODE_LEN),
            assigned_agent: None,
            offer: None,
            process_peer: None,
            finalization: None,
            room_id: None,
            submitted_at: Instant::now(),
            finished_at: None,
        }
    }

    pub fn status(&self) -> SpawnStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, to: SpawnStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Requested region, if any.
    pub fn region(&self) -> Option<&str> {
        self.options
            .get(OPT_REGION)
            .map(String::as_str)
            .filter(|region| !region.is_empty())
    }

    /// Capability tags an agent must carry to run this task.
    pub fn required_capabilities(&self) -> Properties {
        self.options
            .iter()
            .filter(|(key, _)| key.starts_with(CAPABILITY_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn code_for_agent(&self) -> &str {
        &self.code
    }

    /// Exact match against the code issued at creation.
    pub fn verify_code(&self, code: &str) -> bool {
        constant_time_eq(&self.code, code)
    }

    #[cfg(test)]
    pub(crate) fn override_code(&mut self, code: &str) {
        self.code = code.to_string();
    }

    pub fn assigned_agent(&self) -> Option<AgentId> {
        self.assigned_agent
    }

    pub fn offer(&self) -> Option<(AgentId, Instant)> {
        self.offer
    }

    pub fn offered_to(&self) -> Option<AgentId> {
        self.offer.map(|(agent_id, _)| agent_id)
    }

    pub fn set_offer(&mut self, agent_id: AgentId, now: Instant) {
        self.offer = Some((agent_id, now));
    }

    pub fn take_offer(&mut self) -> Option<AgentId> {
        self.offer.take().map(|(agent_id, _)| agent_id)
    }

    /// Places the task on `agent_id`. A placed task is never moved.
    pub fn assign(&mut self, agent_id: AgentId) -> Result<()> {
        if let Some(current) = self.assigned_agent {
            if current != agent_id {
                return Err(OrchestratorError::InvalidTransition {
                    task_id: self.id,
                    from: self.status,
                    to: SpawnStatus::ProcessStarted,
                });
            }
        }
        self.assigned_agent = Some(agent_id);
        Ok(())
    }

    pub fn process_peer(&self) -> Option<PeerId> {
        self.process_peer
    }

    pub fn bind_process(&mut self, peer_id: PeerId) {
        self.process_peer = Some(peer_id);
    }

    pub fn finalization(&self) -> Option<&FinalizationData> {
        self.finalization.as_ref()
    }

    /// Stores the finalization data. It can only be set once.
    pub fn set_finalization(&mut self, data: FinalizationData, room_id: RoomId) -> Result<()> {
        if self.finalization.is_some() {
            return Err(OrchestratorError::AlreadyFinalized(self.id));
        }
        self.finalization = Some(FinalizationData {
            room_id: Some(room_id),
            ..data
        });
        self.room_id = Some(room_id);
        Ok(())
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }

    /// Whether the retention window after the terminal status has passed.
    pub fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        self.finished_at
            .is_some_and(|finished| now.saturating_duration_since(finished) >= retention)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            requester: self.requester.name().to_string(),
            status: self.status.to_string(),
            region: self.region().map(str::to_string),
            assigned_agent: self.assigned_agent,
            offered_to: self.offered_to(),
            room_id: self.room_id,
            age_ms: self.submitted_at.elapsed().as_millis() as u64,
        }
    }
}

/// Read-only view handed to monitoring. Leaves out the security code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub requester: String,
    pub status: String,
    pub region: Option<String>,
    pub assigned_agent: Option<AgentId>,
    pub offered_to: Option<AgentId>,
    pub room_id: Option<RoomId>,
    pub age_ms: u64,
}
