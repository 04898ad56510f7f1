//! Rooms and the access grants that let players into them
//!
//! A room is owned by the peer that registered it (or by the spawned
//! process that finalized its task). Players never talk to the room
//! through the master: they obtain a short-lived grant here, hand its token
//! to the room process, and the room process redeems it with the master.

use crate::auth::{constant_time_eq, generate_secret, Identity};
use crate::error::{OrchestratorError, Result};
use log::{debug, info, warn};
use serde::Serialize;
use shared::{AccessGrant, PeerId, Properties, RoomId, RoomInfo, RoomOptions, TaskId};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

const ACCESS_TOKEN_LEN: usize = 32;

/// Filter key matched against the room's region instead of its properties.
pub const FILTER_REGION: &str = "region";

pub struct RoomEntry {
    pub id: RoomId,
    pub owner: PeerId,
    pub options: RoomOptions,
    /// Task the room was spawned by, if any
    pub task_id: Option<TaskId>,
    players: BTreeSet<String>,
    created_at: Instant,
}

impl RoomEntry {
    pub fn player_count(&self) -> u32 {
        self.players.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.player_count() >= self.options.max_players
    }

    pub fn has_player(&self, username: &str) -> bool {
        self.players.contains(username)
    }

    fn password(&self) -> Option<&str> {
        self.options.password.as_deref().filter(|p| !p.is_empty())
    }

    fn is_hidden(&self, key: &str) -> bool {
        self.options.hidden_properties.iter().any(|hidden| hidden == key)
    }

    /// Listing view: no password, no hidden properties.
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.options.name.clone(),
            address: self.options.address.clone(),
            region: self.options.region.clone(),
            max_players: self.options.max_players,
            player_count: self.player_count(),
            has_password: self.password().is_some(),
            properties: self
                .options
                .properties
                .iter()
                .filter(|(key, _)| !self.is_hidden(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn matches(&self, filters: &Properties) -> bool {
        filters.iter().all(|(key, value)| {
            if key == FILTER_REGION {
                return &self.options.region == value;
            }
            !self.is_hidden(key) && self.options.properties.get(key) == Some(value)
        })
    }
}

/// Monitoring view of a room. Unlike [`RoomInfo`] it includes private rooms
/// and the player list, but still never the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub name: String,
    pub owner: PeerId,
    pub region: String,
    pub address: String,
    pub is_public: bool,
    pub has_password: bool,
    pub max_players: u32,
    pub players: Vec<String>,
    pub task_id: Option<TaskId>,
    pub uptime_secs: u64,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, RoomEntry>,
}

impl RoomRegistry {
    /// Adds a room under an ID allocated by the caller.
    pub fn register(&mut self, id: RoomId, owner: PeerId, options: RoomOptions, task_id: Option<TaskId>) {
        info!(
            "Room {} '{}' registered by peer {} at {}",
            id, options.name, owner, options.address
        );
        self.rooms.insert(
            id,
            RoomEntry {
                id,
                owner,
                options,
                task_id,
                players: BTreeSet::new(),
                created_at: Instant::now(),
            },
        );
    }

    /// Looks up a room and checks that `owner` owns it.
    pub fn owned(&mut self, owner: PeerId, id: RoomId) -> Result<&mut RoomEntry> {
        let room = self
            .rooms
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if room.owner != owner {
            return Err(OrchestratorError::Forbidden(id));
        }
        Ok(room)
    }

    /// Replaces a room's options. Players already inside stay, so the new
    /// maximum may not drop below the current occupancy.
    pub fn update(&mut self, owner: PeerId, id: RoomId, options: RoomOptions) -> Result<()> {
        let room = self.owned(owner, id)?;
        if options.max_players < room.player_count() {
            warn!(
                "Room {} cannot shrink to {} players with {} inside",
                id,
                options.max_players,
                room.player_count()
            );
            return Err(OrchestratorError::Full(id));
        }
        debug!("Room {} updated", id);
        room.options = options;
        Ok(())
    }

    /// Removes a room. Destroying a room that does not exist succeeds.
    pub fn destroy(&mut self, owner: PeerId, id: RoomId) -> Result<bool> {
        match self.rooms.get(&id) {
            None => Ok(false),
            Some(room) if room.owner != owner => Err(OrchestratorError::Forbidden(id)),
            Some(_) => {
                self.rooms.remove(&id);
                info!("Room {} destroyed", id);
                Ok(true)
            }
        }
    }

    /// Drops every room owned by a peer that went away.
    pub fn remove_owned_by(&mut self, owner: PeerId) -> Vec<RoomId> {
        let mut removed: Vec<RoomId> = self
            .rooms
            .values()
            .filter(|room| room.owner == owner)
            .map(|room| room.id)
            .collect();
        removed.sort_unstable();
        for id in &removed {
            self.rooms.remove(id);
            info!("Room {} closed, owner {} disconnected", id, owner);
        }
        removed
    }

    pub fn player_left(&mut self, owner: PeerId, id: RoomId, username: &str) -> Result<bool> {
        let room = self.owned(owner, id)?;
        if !room.has_player(username) {
            return Ok(false);
        }
        room.players.remove(username);
        Ok(true)
    }

    pub(crate) fn add_player(&mut self, id: RoomId, username: String) -> Result<()> {
        let room = self
            .rooms
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if room.is_full() {
            return Err(OrchestratorError::Full(id));
        }
        room.players.insert(username);
        Ok(())
    }

    pub fn get(&self, id: RoomId) -> Option<&RoomEntry> {
        self.rooms.get(&id)
    }

    /// Public rooms matching every filter, ordered by ID.
    pub fn list(&self, filters: &Properties) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .rooms
            .values()
            .filter(|room| room.options.is_public && room.matches(filters))
            .map(RoomEntry::info)
            .collect();
        rooms.sort_by_key(|room| room.id);
        rooms
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .values()
            .map(|room| RoomSnapshot {
                id: room.id,
                name: room.options.name.clone(),
                owner: room.owner,
                region: room.options.region.clone(),
                address: room.options.address.clone(),
                is_public: room.options.is_public,
                has_password: room.password().is_some(),
                max_players: room.options.max_players,
                players: room.players.iter().cloned().collect(),
                task_id: room.task_id,
                uptime_secs: room.created_at.elapsed().as_secs(),
            })
            .collect();
        rooms.sort_by_key(|room| room.id);
        rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

struct PendingGrant {
    room_id: RoomId,
    identity: Identity,
    expires_at: Instant,
}

/// Issues and redeems single-use access grants.
pub struct AccessBroker {
    grants: HashMap<String, PendingGrant>,
    ttl: Duration,
}

impl AccessBroker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: HashMap::new(),
            ttl,
        }
    }

    /// Checks the room's password and capacity, then issues a grant.
    pub fn request_access(
        &mut self,
        rooms: &RoomRegistry,
        room_id: RoomId,
        identity: &Identity,
        password: Option<&str>,
    ) -> Result<AccessGrant> {
        let room = rooms.get(room_id).ok_or(OrchestratorError::NotFound(room_id))?;

        if let Some(expected) = room.password() {
            let given = password.unwrap_or_default();
            if !constant_time_eq(expected, given) {
                warn!(
                    "Peer {} gave a wrong password for room {}",
                    identity.peer_id, room_id
                );
                return Err(OrchestratorError::Forbidden(room_id));
            }
        }
        if room.is_full() {
            return Err(OrchestratorError::Full(room_id));
        }

        let token = generate_secret(ACCESS_TOKEN_LEN);
        self.grants.insert(
            token.clone(),
            PendingGrant {
                room_id,
                identity: identity.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!("Access grant issued to {} for room {}", identity.username, room_id);

        Ok(AccessGrant {
            token,
            room_id,
            address: room.options.address.clone(),
            expires_in_ms: self.ttl.as_millis() as u64,
        })
    }

    /// Verifies a token without consuming it.
    ///
    /// Expired tokens are dropped on sight. A token issued for another room
    /// is rejected but stays valid for its own room.
    pub fn check(&mut self, room_id: RoomId, token: &str, now: Instant) -> Result<&Identity> {
        let expired = match self.grants.get(token) {
            None => {
                warn!("Unknown access token presented for room {}", room_id);
                return Err(OrchestratorError::InvalidGrant(room_id));
            }
            Some(grant) => now >= grant.expires_at,
        };
        if expired {
            self.grants.remove(token);
            debug!("Expired access token presented for room {}", room_id);
            return Err(OrchestratorError::InvalidGrant(room_id));
        }

        match self.grants.get(token) {
            Some(grant) if grant.room_id == room_id => Ok(&grant.identity),
            _ => {
                warn!("Access token for another room presented to room {}", room_id);
                Err(OrchestratorError::InvalidGrant(room_id))
            }
        }
    }

    /// Consumes a token previously accepted by [`AccessBroker::check`].
    pub fn redeem(&mut self, token: &str) -> Option<Identity> {
        self.grants.remove(token).map(|grant| grant.identity)
    }

    /// Invalidates all outstanding grants for a room.
    pub fn revoke_room(&mut self, room_id: RoomId) {
        self.grants.retain(|_, grant| grant.room_id != room_id);
    }

    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.grants.len();
        self.grants.retain(|_, grant| now < grant.expires_at);
        before - self.grants.len()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
