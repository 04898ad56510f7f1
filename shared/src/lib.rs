use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_MASTER_PORT: u16 = 5000;
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Launch option keys understood by the master when it builds a room
/// from a finalized spawn task.
pub const OPT_REGION: &str = "region";
pub const OPT_ROOM_NAME: &str = "room.name";
pub const OPT_MAX_PLAYERS: &str = "room.max_players";
pub const OPT_PUBLIC: &str = "room.public";
pub const OPT_PASSWORD: &str = "room.password";
/// Options prefixed with this must match an agent capability exactly.
pub const CAPABILITY_PREFIX: &str = "cap.";

pub type PeerId = u32;
pub type AgentId = u32;
pub type TaskId = u32;
pub type RoomId = u32;
pub type Properties = HashMap<String, String>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnStatus {
    None,
    Queued,
    ProcessStarted,
    ProcessRegistered,
    Finalized,
    Aborted,
    Killed,
}

impl SpawnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SpawnStatus::Finalized | SpawnStatus::Aborted | SpawnStatus::Killed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Success moves strictly forward one step at a time. Both failure
    /// states can be entered from anywhere that is not already terminal.
    pub fn can_transition_to(self, next: SpawnStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SpawnStatus::Aborted | SpawnStatus::Killed => true,
            SpawnStatus::Queued => self == SpawnStatus::None,
            SpawnStatus::ProcessStarted => self == SpawnStatus::Queued,
            SpawnStatus::ProcessRegistered => self == SpawnStatus::ProcessStarted,
            SpawnStatus::Finalized => self == SpawnStatus::ProcessRegistered,
            SpawnStatus::None => false,
        }
    }
}

impl fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpawnStatus::None => "none",
            SpawnStatus::Queued => "queued",
            SpawnStatus::ProcessStarted => "process-started",
            SpawnStatus::ProcessRegistered => "process-registered",
            SpawnStatus::Finalized => "finalized",
            SpawnStatus::Aborted => "aborted",
            SpawnStatus::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Error codes carried by `Packet::Error`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PermissionDenied,
    DuplicateRegistration,
    NoCapacity,
    QueueTimeout,
    InvalidSecurityCode,
    UnknownAgent,
    UnknownTask,
    CannotCancel,
    InvalidTransition,
    NotRegistered,
    NotFinalized,
    AlreadyFinalized,
    NotFound,
    Forbidden,
    Full,
    InvalidGrant,
    NotConnected,
    Unsupported,
}

/// What a worker host declares when it registers as a spawner.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SpawnerInfo {
    pub region: String,
    /// Zero means "use the master's default".
    pub max_processes: u32,
    pub capabilities: Properties,
}

/// Data a spawned process reports once it is ready to accept players.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct FinalizationData {
    pub address: String,
    /// A room the process registered itself; `None` asks the master to
    /// create one from the task's launch options.
    pub room_id: Option<RoomId>,
    pub payload: Properties,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoomOptions {
    pub name: String,
    pub address: String,
    pub region: String,
    pub max_players: u32,
    pub is_public: bool,
    pub password: Option<String>,
    pub properties: Properties,
    /// Property keys the owner does not want exposed in listings.
    pub hidden_properties: Vec<String>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            region: String::new(),
            max_players: 10,
            is_public: true,
            password: None,
            properties: HashMap::new(),
            hidden_properties: Vec::new(),
        }
    }
}

/// Listing entry sent to clients. Never carries the password.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub address: String,
    pub region: String,
    pub max_players: u32,
    pub player_count: u32,
    pub has_password: bool,
    pub properties: Properties,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub name: String,
    /// Representative address for client-side latency probing.
    pub address: Option<String>,
    pub agents: u32,
    pub free_slots: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub token: String,
    pub room_id: RoomId,
    pub address: String,
    pub expires_in_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Connection management
    Hello {
        protocol_version: u32,
        credentials: Option<String>,
    },
    Welcome {
        peer_id: PeerId,
        privilege: u32,
    },
    Rejected {
        reason: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    Goodbye,
    Error {
        request_id: u32,
        code: ErrorCode,
        message: String,
    },
    Done {
        request_id: u32,
    },

    // Spawner agents
    RegisterSpawner {
        request_id: u32,
        info: SpawnerInfo,
    },
    SpawnerRegistered {
        request_id: u32,
        agent_id: AgentId,
    },
    CapacityReport {
        running: u32,
        timestamp: u64,
    },
    LaunchProcess {
        task_id: TaskId,
        code: String,
        options: Properties,
    },
    ProcessStarted {
        task_id: TaskId,
        /// Agent clock when the process was launched, same scale as
        /// capacity report timestamps
        timestamp: u64,
    },
    LaunchDeclined {
        task_id: TaskId,
        reason: String,
    },
    ProcessExited {
        task_id: TaskId,
    },
    KillProcess {
        task_id: TaskId,
    },

    // Spawn requesters
    RequestSpawn {
        request_id: u32,
        options: Properties,
    },
    SpawnAccepted {
        request_id: u32,
        task_id: TaskId,
    },
    CancelSpawn {
        request_id: u32,
        task_id: TaskId,
    },
    KillSpawn {
        request_id: u32,
        task_id: TaskId,
    },
    SpawnStatusChanged {
        task_id: TaskId,
        status: SpawnStatus,
        reason: Option<String>,
    },
    GetFinalization {
        request_id: u32,
        task_id: TaskId,
    },
    Finalization {
        request_id: u32,
        task_id: TaskId,
        data: FinalizationData,
    },

    // Spawned processes
    RegisterSpawnedProcess {
        request_id: u32,
        task_id: TaskId,
        code: String,
    },
    SpawnedProcessRegistered {
        request_id: u32,
        task_id: TaskId,
        options: Properties,
    },
    CompleteSpawn {
        request_id: u32,
        task_id: TaskId,
        data: FinalizationData,
    },
    SpawnCompleted {
        request_id: u32,
        task_id: TaskId,
        room_id: RoomId,
    },

    // Rooms
    RegisterRoom {
        request_id: u32,
        options: RoomOptions,
    },
    RoomRegistered {
        request_id: u32,
        room_id: RoomId,
    },
    UpdateRoom {
        request_id: u32,
        room_id: RoomId,
        options: RoomOptions,
    },
    DestroyRoom {
        request_id: u32,
        room_id: RoomId,
    },
    RequestAccess {
        request_id: u32,
        room_id: RoomId,
        password: Option<String>,
    },
    AccessGranted {
        request_id: u32,
        grant: AccessGrant,
    },
    ValidateAccess {
        request_id: u32,
        room_id: RoomId,
        token: String,
    },
    AccessValidated {
        request_id: u32,
        username: String,
        peer_id: PeerId,
    },
    PlayerLeft {
        room_id: RoomId,
        username: String,
    },
    ListRooms {
        request_id: u32,
        filters: Properties,
    },
    RoomList {
        request_id: u32,
        rooms: Vec<RoomInfo>,
    },
    ListRegions {
        request_id: u32,
    },
    RegionList {
        request_id: u32,
        regions: Vec<RegionInfo>,
    },
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(packet)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SpawnStatus; 7] = [
        SpawnStatus::None,
        SpawnStatus::Queued,
        SpawnStatus::ProcessStarted,
        SpawnStatus::ProcessRegistered,
        SpawnStatus::Finalized,
        SpawnStatus::Aborted,
        SpawnStatus::Killed,
    ];

    #[test]
    fn test_success_path_is_valid() {
        let path = [
            SpawnStatus::None,
            SpawnStatus::Queued,
            SpawnStatus::ProcessStarted,
            SpawnStatus::ProcessRegistered,
            SpawnStatus::Finalized,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping_steps() {
        assert!(!SpawnStatus::Queued.can_transition_to(SpawnStatus::ProcessRegistered));
        assert!(!SpawnStatus::ProcessStarted.can_transition_to(SpawnStatus::Finalized));
        assert!(!SpawnStatus::None.can_transition_to(SpawnStatus::ProcessStarted));
    }

    #[test]
    fn test_terminal_states_are_terminal() {
        for from in [SpawnStatus::Finalized, SpawnStatus::Aborted, SpawnStatus::Killed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_failures_reachable_from_non_terminal() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(SpawnStatus::Aborted));
            assert!(from.can_transition_to(SpawnStatus::Killed));
        }
    }

    #[test]
    fn test_room_options_default() {
        let options = RoomOptions::default();
        assert!(options.is_public);
        assert!(options.password.is_none());
        assert_eq!(options.max_players, 10);
    }

    #[test]
    fn test_packet_codec_launch_process() {
        let mut options = Properties::new();
        options.insert(OPT_REGION.to_string(), "eu".to_string());

        let packet = Packet::LaunchProcess {
            task_id: 7,
            code: "abc123".to_string(),
            options,
        };
        let bytes = encode(&packet).unwrap();
        assert!(bytes.len() < MAX_DATAGRAM_SIZE);

        match decode(&bytes).unwrap() {
            Packet::LaunchProcess {
                task_id,
                code,
                options,
            } => {
                assert_eq!(task_id, 7);
                assert_eq!(code, "abc123");
                assert_eq!(options.get(OPT_REGION).map(String::as_str), Some("eu"));
            }
            other => panic!("Wrong packet type after decoding: {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
