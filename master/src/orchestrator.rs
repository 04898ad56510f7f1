//! The orchestration service context
//!
//! [`Orchestrator`] owns every registry and applies each operation
//! atomically. The network layer keeps it behind a single
//! `Arc<RwLock<_>>` and takes the write lock for every mutation, so
//! transitions of one task are applied in order no matter which
//! connection delivered them.
//!
//! Operations that require messages to agents return them as
//! [`Outbound`] values instead of sending anything themselves.

use crate::agents::AgentRegistry;
use crate::auth::{Identity, Requester};
use crate::config::MasterConfig;
use crate::error::{OrchestratorError, Result};
use crate::notify::StatusChange;
use crate::regions::RegionDirectory;
use crate::rooms::{AccessBroker, RoomRegistry};
use crate::scheduler::{Outbound, SpawnScheduler};
use log::{debug, info};
use shared::{
    AccessGrant, AgentId, FinalizationData, PeerId, Properties, RegionInfo, RoomId, RoomInfo,
    RoomOptions, SpawnerInfo, TaskId, OPT_MAX_PLAYERS, OPT_PASSWORD, OPT_PUBLIC, OPT_ROOM_NAME,
};
use std::time::Instant;
use tokio::sync::mpsc;

/// Allocates task and room IDs from one sequence, so a spawned room can
/// take over the ID of its task without colliding with registered rooms.
#[derive(Debug)]
pub struct IdSequence {
    next: u32,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdSequence {
    pub fn next(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        id
    }
}

pub struct Orchestrator {
    config: MasterConfig,
    ids: IdSequence,
    agents: AgentRegistry,
    scheduler: SpawnScheduler,
    rooms: RoomRegistry,
    access: AccessBroker,
}

impl Orchestrator {
    pub fn new(config: MasterConfig) -> Self {
        let regions = RegionDirectory::new(config.regions.clone());
        Self {
            ids: IdSequence::default(),
            agents: AgentRegistry::new(config.default_max_processes, regions),
            scheduler: SpawnScheduler::new(config.scheduler.clone()),
            rooms: RoomRegistry::default(),
            access: AccessBroker::new(config.grant_ttl),
            config,
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn scheduler(&self) -> &SpawnScheduler {
        &self.scheduler
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    fn agent_of(&self, peer_id: PeerId) -> Result<AgentId> {
        self.agents
            .find_by_peer(peer_id)
            .ok_or(OrchestratorError::NotSpawner(peer_id))
    }

    // Agents

    pub fn register_agent(&mut self, identity: &Identity, info: SpawnerInfo) -> Result<AgentId> {
        if identity.privilege < self.config.min_register_privilege {
            return Err(OrchestratorError::PermissionDenied {
                required: self.config.min_register_privilege,
                actual: identity.privilege,
            });
        }
        self.agents.register(identity.peer_id, info)
    }

    /// Applies a capacity report and places queued tasks on freed slots.
    pub fn report_capacity(&mut self, peer_id: PeerId, running: u32, timestamp: u64) -> Result<Vec<Outbound>> {
        let agent_id = self.agent_of(peer_id)?;
        if self.agents.report_capacity(agent_id, running, timestamp)? {
            Ok(self.scheduler.place(&mut self.agents))
        } else {
            Ok(Vec::new())
        }
    }

    pub fn process_started(&mut self, peer_id: PeerId, task_id: TaskId, started_at: u64) -> Result<Vec<Outbound>> {
        let agent_id = self.agent_of(peer_id)?;
        self.scheduler.process_started(agent_id, task_id, started_at, &mut self.agents)
    }

    /// Declined tasks wait for the next tick; retrying at once could bounce
    /// straight back to the same agent.
    pub fn launch_declined(&mut self, peer_id: PeerId, task_id: TaskId, reason: &str) -> Result<()> {
        let agent_id = self.agent_of(peer_id)?;
        self.scheduler
            .launch_declined(agent_id, task_id, reason, &mut self.agents);
        Ok(())
    }

    pub fn process_exited(&mut self, peer_id: PeerId, task_id: TaskId) -> Result<()> {
        let agent_id = self.agent_of(peer_id)?;
        self.scheduler.process_exited(agent_id, task_id)
    }

    // Spawn requests

    pub fn submit(&mut self, requester: Requester, options: Properties) -> Result<(TaskId, Vec<Outbound>)> {
        let id = self.ids.next();
        let outbound = self.scheduler.submit(id, requester, options, &mut self.agents)?;
        Ok((id, outbound))
    }

    pub fn cancel(&mut self, requester: &Requester, task_id: TaskId) -> Result<()> {
        self.scheduler.cancel(requester, task_id, &mut self.agents)
    }

    pub fn kill(&mut self, requester: &Requester, task_id: TaskId) -> Result<Vec<Outbound>> {
        if let Requester::Peer(identity) = requester {
            if identity.privilege < self.config.admin_privilege {
                return Err(OrchestratorError::PermissionDenied {
                    required: self.config.admin_privilege,
                    actual: identity.privilege,
                });
            }
        }
        info!("Task {} kill requested by {}", task_id, requester.name());
        self.scheduler.kill(task_id, &mut self.agents)
    }

    pub fn finalization(&self, requester: &Requester, task_id: TaskId) -> Result<FinalizationData> {
        self.scheduler.finalization(requester, task_id)
    }

    pub fn subscribe_all(&mut self) -> mpsc::UnboundedReceiver<StatusChange> {
        self.scheduler.subscribe_all()
    }

    pub fn subscribe_task(&mut self, task_id: TaskId) -> Result<mpsc::UnboundedReceiver<StatusChange>> {
        self.scheduler.subscribe_task(task_id)
    }

    // Spawned processes

    pub fn register_process(&mut self, peer_id: PeerId, task_id: TaskId, code: &str) -> Result<Properties> {
        self.scheduler.register_process(peer_id, task_id, code)
    }

    /// Finalizes a task and creates or links its room.
    ///
    /// With `data.room_id` set, the process must already own that room.
    /// Otherwise a room is created from the launch options under the
    /// task's ID, in the region of the agent that ran it.
    pub fn finalize(&mut self, peer_id: PeerId, task_id: TaskId, data: FinalizationData) -> Result<RoomId> {
        let task = self.scheduler.check_finalizable(peer_id, task_id)?;

        let room_id = match data.room_id {
            Some(room_id) => {
                let room = self.rooms.owned(peer_id, room_id)?;
                room.task_id = Some(task_id);
                room_id
            }
            None => {
                let region = task
                    .assigned_agent()
                    .and_then(|agent_id| self.agents.get(agent_id))
                    .map(|agent| agent.region.clone())
                    .unwrap_or_default();
                let options = room_options_for_task(task_id, &task.options, region, &data);
                self.rooms.register(task_id, peer_id, options, Some(task_id));
                task_id
            }
        };

        self.scheduler.finalize(task_id, data, room_id)?;
        Ok(room_id)
    }

    // Rooms

    pub fn register_room(&mut self, owner: PeerId, options: RoomOptions) -> RoomId {
        let id = self.ids.next();
        self.rooms.register(id, owner, options, None);
        id
    }

    pub fn update_room(&mut self, owner: PeerId, room_id: RoomId, options: RoomOptions) -> Result<()> {
        self.rooms.update(owner, room_id, options)
    }

    pub fn destroy_room(&mut self, owner: PeerId, room_id: RoomId) -> Result<()> {
        if self.rooms.destroy(owner, room_id)? {
            self.access.revoke_room(room_id);
        }
        Ok(())
    }

    pub fn request_access(
        &mut self,
        identity: &Identity,
        room_id: RoomId,
        password: Option<&str>,
    ) -> Result<AccessGrant> {
        self.access
            .request_access(&self.rooms, room_id, identity, password)
    }

    /// Redeems a player's grant on behalf of the room that owns `room_id`.
    ///
    /// The grant is consumed only when the player actually gets in.
    pub fn validate_access(&mut self, owner: PeerId, room_id: RoomId, token: &str, now: Instant) -> Result<Identity> {
        if self.rooms.owned(owner, room_id)?.is_full() {
            self.access.check(room_id, token, now)?;
            return Err(OrchestratorError::Full(room_id));
        }
        let identity = self.access.check(room_id, token, now)?.clone();

        self.access.redeem(token);
        self.rooms.add_player(room_id, identity.username.clone())?;
        debug!("{} joined room {}", identity.username, room_id);
        Ok(identity)
    }

    pub fn player_left(&mut self, owner: PeerId, room_id: RoomId, username: &str) -> Result<()> {
        if self.rooms.player_left(owner, room_id, username)? {
            debug!("{} left room {}", username, room_id);
        }
        Ok(())
    }

    pub fn list_rooms(&self, filters: &Properties) -> Vec<RoomInfo> {
        self.rooms.list(filters)
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.agents.regions()
    }

    // Housekeeping

    /// Cleans up after a peer that disconnected or timed out, whatever
    /// roles it had.
    pub fn peer_lost(&mut self, peer_id: PeerId) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if let Some(agent_id) = self.agents.find_by_peer(peer_id) {
            self.agents.unregister(agent_id);
            self.scheduler.agent_lost(agent_id);
        }
        self.scheduler.requester_lost(peer_id, &mut self.agents);
        outbound.extend(self.scheduler.process_lost(peer_id, &self.agents));

        for room_id in self.rooms.remove_owned_by(peer_id) {
            self.access.revoke_room(room_id);
        }

        outbound.extend(self.scheduler.place(&mut self.agents));
        outbound
    }

    /// Periodic work: offers, queue timeouts, placement, purges.
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let outbound = self.scheduler.tick(now, &mut self.agents);
        let purged = self.access.purge_expired(now);
        if purged > 0 {
            debug!("Purged {} expired access grants", purged);
        }
        outbound
    }
}

fn room_options_for_task(
    task_id: TaskId,
    launch: &Properties,
    region: String,
    data: &FinalizationData,
) -> RoomOptions {
    let defaults = RoomOptions::default();
    RoomOptions {
        name: launch
            .get(OPT_ROOM_NAME)
            .cloned()
            .unwrap_or_else(|| format!("Room {}", task_id)),
        address: data.address.clone(),
        region,
        max_players: launch
            .get(OPT_MAX_PLAYERS)
            .and_then(|value| value.parse().ok())
            .filter(|max| *max > 0)
            .unwrap_or(defaults.max_players),
        is_public: !launch
            .get(OPT_PUBLIC)
            .is_some_and(|value| value.eq_ignore_ascii_case("false") || value == "0"),
        password: launch.get(OPT_PASSWORD).filter(|p| !p.is_empty()).cloned(),
        properties: data.payload.clone(),
        hidden_properties: defaults.hidden_properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use shared::{SpawnStatus, OPT_REGION};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(MasterConfig {
            min_register_privilege: 5,
            admin_privilege: 10,
            scheduler: SchedulerConfig {
                min_spawn_privilege: 1,
                queue_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn peer(peer_id: PeerId, privilege: u32) -> Identity {
        Identity {
            peer_id,
            username: format!("peer-{}", peer_id),
            privilege,
        }
    }

    fn spawner(orch: &mut Orchestrator, peer_id: PeerId, region: &str, max: u32) -> AgentId {
        let info = SpawnerInfo {
            region: region.to_string(),
            max_processes: max,
            capabilities: Properties::new(),
        };
        orch.register_agent(&peer(peer_id, 5), info).unwrap()
    }

    fn launch_code(outbound: &[Outbound], task: TaskId) -> String {
        outbound
            .iter()
            .find_map(|o| match o {
                Outbound::Launch { task_id, code, .. } if *task_id == task => Some(code.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn eu() -> Properties {
        [(OPT_REGION.to_string(), "eu".to_string())].into()
    }

    #[test]
    fn test_id_sequence_is_shared() {
        let mut orch = orchestrator();
        let room = orch.register_room(1, RoomOptions::default());
        let (task, _) = orch
            .submit(Requester::Internal("lobby".to_string()), Properties::new())
            .unwrap();
        assert_ne!(room, task);
        assert!(task > room);
    }

    #[test]
    fn test_agent_registration_requires_privilege() {
        let mut orch = orchestrator();
        assert_eq!(
            orch.register_agent(&peer(1, 4), SpawnerInfo {
                region: "eu".to_string(),
                max_processes: 1,
                capabilities: Properties::new(),
            }),
            Err(OrchestratorError::PermissionDenied {
                required: 5,
                actual: 4
            })
        );
        assert!(orch.agents().is_empty());
        assert_eq!(
            orch.report_capacity(1, 0, 1),
            Err(OrchestratorError::NotSpawner(1))
        );
    }

    #[test]
    fn test_single_slot_region_queues_second_request() {
        let mut orch = orchestrator();
        spawner(&mut orch, 1, "eu", 1);
        let lobby = Requester::Peer(peer(2, 1));

        let (first, out) = orch.submit(lobby.clone(), eu()).unwrap();
        let code = launch_code(&out, first);
        assert_ok!(orch.process_started(1, first, 1));

        let (second, out) = orch.submit(lobby.clone(), eu()).unwrap();
        assert!(out.is_empty());
        assert_eq!(
            orch.scheduler().get(second).unwrap().status(),
            SpawnStatus::Queued
        );
        assert!(orch.tick(Instant::now()).is_empty());

        // The first room comes up, runs, and its process exits.
        orch.register_process(3, first, &code).unwrap();
        orch.finalize(3, first, FinalizationData {
            address: "10.0.0.1:7777".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_ok!(orch.process_exited(1, first));
        let out = orch.report_capacity(1, 0, 2).unwrap();

        launch_code(&out, second);
        assert_ok!(orch.process_started(1, second, 3));
        assert_eq!(
            orch.scheduler().get(second).unwrap().status(),
            SpawnStatus::ProcessStarted
        );
        assert_eq!(
            orch.scheduler().get(first).unwrap().status(),
            SpawnStatus::Finalized
        );
    }

    #[test]
    fn test_handshake_and_room_creation() {
        let mut orch = orchestrator();
        spawner(&mut orch, 1, "eu", 2);
        let requester = Requester::Peer(peer(2, 1));

        let mut options = eu();
        options.insert(OPT_ROOM_NAME.to_string(), "Arena".to_string());
        options.insert(OPT_MAX_PLAYERS.to_string(), "4".to_string());
        let (task_id, out) = orch.submit(requester.clone(), options).unwrap();
        let code = launch_code(&out, task_id);
        orch.process_started(1, task_id, 1).unwrap();

        assert_eq!(
            orch.register_process(3, task_id, "abc123"),
            Err(OrchestratorError::InvalidSecurityCode(task_id))
        );
        assert_eq!(
            orch.scheduler().get(task_id).unwrap().status(),
            SpawnStatus::ProcessStarted
        );

        let launch = orch.register_process(3, task_id, &code).unwrap();
        assert_eq!(launch.get(OPT_ROOM_NAME).map(String::as_str), Some("Arena"));

        let data = FinalizationData {
            address: "10.0.0.1:7777".to_string(),
            room_id: None,
            payload: [("mode".to_string(), "ctf".to_string())].into(),
        };
        assert_eq!(
            orch.finalize(4, task_id, data.clone()),
            Err(OrchestratorError::NotRegistered(task_id))
        );
        let room_id = orch.finalize(3, task_id, data).unwrap();
        assert_eq!(room_id, task_id);

        let rooms = orch.list_rooms(&Properties::new());
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "Arena");
        assert_eq!(rooms[0].region, "eu");
        assert_eq!(rooms[0].max_players, 4);
        assert_eq!(rooms[0].address, "10.0.0.1:7777");

        let stored = orch.finalization(&requester, task_id).unwrap();
        assert_eq!(stored.room_id, Some(room_id));
        assert_eq!(stored.payload.get("mode").map(String::as_str), Some("ctf"));
    }

    #[test]
    fn test_finalize_links_owned_room() {
        let mut orch = orchestrator();
        spawner(&mut orch, 1, "eu", 1);
        let (task_id, out) = orch
            .submit(Requester::Internal("lobby".to_string()), Properties::new())
            .unwrap();
        let code = launch_code(&out, task_id);
        orch.process_started(1, task_id, 1).unwrap();
        orch.register_process(3, task_id, &code).unwrap();

        let foreign = orch.register_room(9, RoomOptions::default());
        let own = orch.register_room(3, RoomOptions::default());
        let link = |room_id| FinalizationData {
            address: "10.0.0.1:7777".to_string(),
            room_id: Some(room_id),
            payload: Properties::new(),
        };

        assert_eq!(
            orch.finalize(3, task_id, link(foreign)),
            Err(OrchestratorError::Forbidden(foreign))
        );
        assert_eq!(
            orch.finalize(3, task_id, link(999)),
            Err(OrchestratorError::NotFound(999))
        );
        assert_eq!(orch.finalize(3, task_id, link(own)), Ok(own));
        assert_eq!(orch.rooms().get(own).unwrap().task_id, Some(task_id));
        assert_eq!(orch.rooms().len(), 2);
    }

    #[test]
    fn test_private_room_from_launch_options() {
        let launch: Properties = [
            (OPT_PUBLIC.to_string(), "false".to_string()),
            (OPT_PASSWORD.to_string(), "pw".to_string()),
            (OPT_MAX_PLAYERS.to_string(), "lots".to_string()),
        ]
        .into();
        let options = room_options_for_task(7, &launch, "us".to_string(), &FinalizationData::default());
        assert_eq!(options.name, "Room 7");
        assert!(!options.is_public);
        assert_eq!(options.password.as_deref(), Some("pw"));
        assert_eq!(options.max_players, 10);
        assert_eq!(options.region, "us");
    }

    #[test]
    fn test_password_room_access() {
        let mut orch = orchestrator();
        let room_id = orch.register_room(
            1,
            RoomOptions {
                name: "Locked".to_string(),
                address: "10.0.0.1:7777".to_string(),
                password: Some("secret".to_string()),
                ..Default::default()
            },
        );
        let player = peer(2, 1);

        assert_eq!(
            orch.request_access(&player, room_id, None),
            Err(OrchestratorError::Forbidden(room_id))
        );
        let grant = orch.request_access(&player, room_id, Some("secret")).unwrap();

        let now = Instant::now();
        assert_eq!(
            orch.validate_access(5, room_id, &grant.token, now),
            Err(OrchestratorError::Forbidden(room_id))
        );
        let identity = orch.validate_access(1, room_id, &grant.token, now).unwrap();
        assert_eq!(identity.username, "peer-2");
        assert_eq!(orch.rooms().get(room_id).unwrap().player_count(), 1);

        assert_eq!(
            orch.validate_access(1, room_id, &grant.token, now),
            Err(OrchestratorError::InvalidGrant(room_id))
        );

        assert_ok!(orch.player_left(1, room_id, "peer-2"));
        assert_eq!(orch.rooms().get(room_id).unwrap().player_count(), 0);
    }

    #[test]
    fn test_full_room_keeps_grant() {
        let mut orch = orchestrator();
        let room_id = orch.register_room(
            1,
            RoomOptions {
                max_players: 1,
                ..Default::default()
            },
        );
        let first = orch.request_access(&peer(2, 1), room_id, None).unwrap();
        let second = orch.request_access(&peer(3, 1), room_id, None).unwrap();

        let now = Instant::now();
        orch.validate_access(1, room_id, &first.token, now).unwrap();
        assert_eq!(
            orch.validate_access(1, room_id, &second.token, now),
            Err(OrchestratorError::Full(room_id))
        );

        orch.player_left(1, room_id, "peer-2").unwrap();
        assert_eq!(
            orch.validate_access(1, room_id, &second.token, now).unwrap().peer_id,
            3
        );
    }

    #[test]
    fn test_room_update_keeps_occupancy_within_max() {
        let mut orch = orchestrator();
        let options = RoomOptions {
            max_players: 3,
            ..Default::default()
        };
        let room_id = orch.register_room(1, options.clone());

        let now = Instant::now();
        for peer_id in 2..=4 {
            let grant = orch.request_access(&peer(peer_id, 1), room_id, None).unwrap();
            orch.validate_access(1, room_id, &grant.token, now).unwrap();
        }

        let shrunk = RoomOptions {
            max_players: 1,
            ..options
        };
        assert_eq!(
            orch.update_room(1, room_id, shrunk),
            Err(OrchestratorError::Full(room_id))
        );
        let room = orch.rooms.get(room_id).unwrap();
        assert_eq!(room.player_count(), 3);
        assert_eq!(room.options.max_players, 3);
    }

    #[test]
    fn test_destroying_room_revokes_grants() {
        let mut orch = orchestrator();
        let room_id = orch.register_room(1, RoomOptions::default());
        let grant = orch.request_access(&peer(2, 1), room_id, None).unwrap();

        assert_ok!(orch.destroy_room(1, room_id));
        assert_ok!(orch.destroy_room(1, room_id));
        assert_eq!(
            orch.validate_access(1, room_id, &grant.token, Instant::now()),
            Err(OrchestratorError::NotFound(room_id))
        );
        assert!(orch.access.is_empty());
    }

    #[test]
    fn test_agent_disconnect_terminates_only_its_tasks() {
        let mut orch = orchestrator();
        spawner(&mut orch, 1, "eu", 1);
        spawner(&mut orch, 2, "us", 1);
        let lobby = Requester::Internal("lobby".to_string());

        let mut us = Properties::new();
        us.insert(OPT_REGION.to_string(), "us".to_string());
        let (eu_task, _) = orch.submit(lobby.clone(), eu()).unwrap();
        let (us_task, _) = orch.submit(lobby.clone(), us).unwrap();
        orch.process_started(1, eu_task, 1).unwrap();
        orch.process_started(2, us_task, 1).unwrap();

        let mut events = orch.subscribe_task(eu_task).unwrap();
        orch.peer_lost(1);

        assert_eq!(orch.agents().len(), 1);
        assert_eq!(orch.scheduler().get(eu_task).unwrap().status(), SpawnStatus::Killed);
        assert_eq!(
            orch.scheduler().get(us_task).unwrap().status(),
            SpawnStatus::ProcessStarted
        );
        assert_eq!(events.try_recv().unwrap().status, SpawnStatus::Killed);
    }

    #[test]
    fn test_owner_disconnect_closes_rooms() {
        let mut orch = orchestrator();
        let room_id = orch.register_room(1, RoomOptions::default());
        orch.register_room(2, RoomOptions::default());
        orch.request_access(&peer(3, 1), room_id, None).unwrap();

        assert!(orch.peer_lost(1).is_empty());
        assert!(orch.rooms().get(room_id).is_none());
        assert_eq!(orch.rooms().len(), 1);
        assert!(orch.access.is_empty());
    }

    #[test]
    fn test_queue_timeout_notifies_once() {
        let mut orch = orchestrator();
        let (task_id, _) = orch
            .submit(Requester::Peer(peer(2, 1)), eu())
            .unwrap();
        let mut events = orch.subscribe_task(task_id).unwrap();

        let later = Instant::now() + Duration::from_secs(31);
        orch.tick(later);
        spawner(&mut orch, 1, "eu", 1);
        assert!(orch.tick(later).is_empty());

        let event = events.try_recv().unwrap();
        assert_eq!(event.status, SpawnStatus::Aborted);
        assert_eq!(event.requester, Some(2));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_kill_requires_admin() {
        let mut orch = orchestrator();
        spawner(&mut orch, 1, "eu", 1);
        let (task_id, _) = orch
            .submit(Requester::Peer(peer(2, 1)), Properties::new())
            .unwrap();
        orch.process_started(1, task_id, 1).unwrap();

        assert_err!(orch.kill(&Requester::Peer(peer(2, 1)), task_id));
        let out = orch.kill(&Requester::Peer(peer(9, 10)), task_id).unwrap();
        assert_eq!(out, vec![Outbound::Kill { agent_peer: 1, task_id }]);
        assert_eq!(orch.scheduler().get(task_id).unwrap().status(), SpawnStatus::Killed);
    }

    #[test]
    fn test_requester_disconnect_cancels_queue() {
        let mut orch = orchestrator();
        let (task_id, _) = orch
            .submit(Requester::Peer(peer(2, 1)), Properties::new())
            .unwrap();
        orch.peer_lost(2);
        assert_eq!(orch.scheduler().get(task_id).unwrap().status(), SpawnStatus::Aborted);
    }

    #[test]
    fn test_process_loss_aborts_task() {
        let mut orch = orchestrator();
        spawner(&mut orch, 1, "eu", 1);
        let (task_id, out) = orch
            .submit(Requester::Internal("lobby".to_string()), Properties::new())
            .unwrap();
        let code = launch_code(&out, task_id);
        orch.process_started(1, task_id, 1).unwrap();
        orch.register_process(3, task_id, &code).unwrap();

        let out = orch.peer_lost(3);
        assert_eq!(out, vec![Outbound::Kill { agent_peer: 1, task_id }]);
        assert_eq!(orch.scheduler().get(task_id).unwrap().status(), SpawnStatus::Aborted);
    }
}
