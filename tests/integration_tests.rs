//! Integration tests for the spawn master and its peers
//!
//! These tests run a real master on a loopback socket and drive it with
//! plain UDP sockets playing the roles of agents, spawned processes,
//! requesters and players.

use agent::config::AgentConfig;
use agent::network::SpawnerAgent;
use master::auth::MasterKeyAuthenticator;
use master::config::MasterConfig;
use master::network::{Server, ServerHandle};
use shared::{
    decode, encode, timestamp_ms, ErrorCode, FinalizationData, Packet, PeerId, Properties, RoomOptions,
    SpawnStatus, SpawnerInfo, TaskId, MAX_DATAGRAM_SIZE, OPT_REGION, OPT_ROOM_NAME,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MASTER_KEY: &str = "integration-key";

async fn start_master() -> (SocketAddr, ServerHandle) {
    let config = MasterConfig {
        bind_address: "127.0.0.1:0".to_string(),
        queue_tick: Duration::from_millis(20),
        ..Default::default()
    };
    let auth = Arc::new(MasterKeyAuthenticator::new(Some(MASTER_KEY.to_string()), 1, 10));
    let mut server = Server::new(config, auth).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(async move { server.run().await });
    (addr, handle)
}

/// A loopback socket that has completed the hello exchange.
struct TestPeer {
    socket: UdpSocket,
    master: SocketAddr,
    peer_id: PeerId,
}

impl TestPeer {
    async fn connect(master: SocketAddr, credentials: Option<&str>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut peer = TestPeer {
            socket,
            master,
            peer_id: 0,
        };
        peer.send(&Packet::Hello {
            protocol_version: PROTOCOL_VERSION,
            credentials: credentials.map(str::to_string),
        })
        .await;
        match peer.recv().await {
            Packet::Welcome { peer_id, .. } => peer.peer_id = peer_id,
            other => panic!("Expected welcome, got {:?}", other),
        }
        peer
    }

    async fn send(&self, packet: &Packet) {
        self.socket
            .send_to(&encode(packet).unwrap(), self.master)
            .await
            .unwrap();
    }

    async fn recv(&self) -> Packet {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(3), self.socket.recv_from(&mut buffer))
            .await
            .expect("no packet from master")
            .unwrap();
        decode(&buffer[..len]).unwrap()
    }

    /// Receives until `pick` accepts a packet, skipping everything else.
    async fn recv_until<T>(&self, mut pick: impl FnMut(Packet) -> Option<T>) -> T {
        loop {
            if let Some(found) = pick(self.recv().await) {
                return found;
            }
        }
    }

    async fn request(&self, packet: &Packet) -> Packet {
        self.send(packet).await;
        self.recv_until(|p| match p {
            Packet::SpawnStatusChanged { .. } | Packet::Heartbeat { .. } => None,
            other => Some(other),
        })
        .await
    }

    async fn wait_status(&self, task_id: TaskId, wanted: SpawnStatus) -> Option<String> {
        self.recv_until(|p| match p {
            Packet::SpawnStatusChanged {
                task_id: id,
                status,
                reason,
            } if id == task_id && status == wanted => Some(reason),
            _ => None,
        })
        .await
    }
}

async fn register_agent(master: SocketAddr, region: &str, max_processes: u32) -> TestPeer {
    let agent = TestPeer::connect(master, Some(MASTER_KEY)).await;
    let info = SpawnerInfo {
        region: region.to_string(),
        max_processes,
        capabilities: Properties::new(),
    };
    match agent.request(&Packet::RegisterSpawner { request_id: 1, info }).await {
        Packet::SpawnerRegistered { .. } => agent,
        other => panic!("Registration failed: {:?}", other),
    }
}

fn spawn_options(region: &str, name: &str) -> Properties {
    let mut options = Properties::new();
    options.insert(OPT_REGION.to_string(), region.to_string());
    options.insert(OPT_ROOM_NAME.to_string(), name.to_string());
    options
}

async fn request_spawn(requester: &TestPeer, options: Properties) -> TaskId {
    match requester
        .request(&Packet::RequestSpawn { request_id: 10, options })
        .await
    {
        Packet::SpawnAccepted { task_id, .. } => task_id,
        other => panic!("Spawn refused: {:?}", other),
    }
}

async fn expect_launch(agent: &TestPeer) -> (TaskId, String, Properties) {
    agent
        .recv_until(|p| match p {
            Packet::LaunchProcess {
                task_id,
                code,
                options,
            } => Some((task_id, code, options)),
            _ => None,
        })
        .await
}

/// SPAWN HANDSHAKE TESTS
mod spawn_flow_tests {
    use super::*;

    /// A request travels from requester to agent to process and ends as a listed room
    #[tokio::test]
    async fn spawn_request_becomes_listed_room() {
        let (master, handle) = start_master().await;
        let agent = register_agent(master, "eu", 2).await;
        let requester = TestPeer::connect(master, None).await;

        let task_id = request_spawn(&requester, spawn_options("eu", "Arena")).await;
        let (launched, code, options) = expect_launch(&agent).await;
        assert_eq!(launched, task_id);
        assert_eq!(options.get(OPT_ROOM_NAME).map(String::as_str), Some("Arena"));

        agent.send(&Packet::ProcessStarted { task_id, timestamp: timestamp_ms() }).await;
        requester.wait_status(task_id, SpawnStatus::ProcessStarted).await;

        let process = TestPeer::connect(master, None).await;
        let registered = process
            .request(&Packet::RegisterSpawnedProcess {
                request_id: 1,
                task_id,
                code,
            })
            .await;
        match registered {
            Packet::SpawnedProcessRegistered { options, .. } => {
                assert_eq!(options.get(OPT_REGION).map(String::as_str), Some("eu"))
            }
            other => panic!("Process registration failed: {:?}", other),
        }
        requester.wait_status(task_id, SpawnStatus::ProcessRegistered).await;

        let data = FinalizationData {
            address: "127.0.0.1:7777".to_string(),
            room_id: None,
            payload: Properties::new(),
        };
        let room_id = match process
            .request(&Packet::CompleteSpawn {
                request_id: 2,
                task_id,
                data,
            })
            .await
        {
            Packet::SpawnCompleted { room_id, .. } => room_id,
            other => panic!("Finalization failed: {:?}", other),
        };
        requester.wait_status(task_id, SpawnStatus::Finalized).await;

        match requester
            .request(&Packet::GetFinalization { request_id: 3, task_id })
            .await
        {
            Packet::Finalization { data, .. } => assert_eq!(data.address, "127.0.0.1:7777"),
            other => panic!("Expected finalization data, got {:?}", other),
        }

        let player = TestPeer::connect(master, None).await;
        let mut filters = Properties::new();
        filters.insert("region".to_string(), "eu".to_string());
        match player.request(&Packet::ListRooms { request_id: 4, filters }).await {
            Packet::RoomList { rooms, .. } => {
                assert_eq!(rooms.len(), 1);
                assert_eq!(rooms[0].id, room_id);
                assert_eq!(rooms[0].name, "Arena");
                assert_eq!(rooms[0].address, "127.0.0.1:7777");
                assert!(!rooms[0].has_password);
            }
            other => panic!("Expected room list, got {:?}", other),
        }

        handle.shutdown();
    }

    /// A process presenting the wrong code is refused and the task stays pending
    #[tokio::test]
    async fn wrong_security_code_is_refused() {
        let (master, handle) = start_master().await;
        let agent = register_agent(master, "eu", 1).await;
        let requester = TestPeer::connect(master, None).await;

        let task_id = request_spawn(&requester, spawn_options("eu", "Arena")).await;
        let (_, code, _) = expect_launch(&agent).await;
        agent.send(&Packet::ProcessStarted { task_id, timestamp: timestamp_ms() }).await;
        requester.wait_status(task_id, SpawnStatus::ProcessStarted).await;

        let impostor = TestPeer::connect(master, None).await;
        match impostor
            .request(&Packet::RegisterSpawnedProcess {
                request_id: 1,
                task_id,
                code: format!("{}x", code),
            })
            .await
        {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidSecurityCode),
            other => panic!("Expected error, got {:?}", other),
        }

        let monitor = handle.monitor();
        let tasks = monitor.tasks().await;
        let task = tasks.iter().find(|t| t.id == task_id).unwrap();
        assert_eq!(task.status, SpawnStatus::ProcessStarted.to_string());

        handle.shutdown();
    }

    /// Losing the agent kills the tasks it was running
    #[tokio::test]
    async fn agent_goodbye_kills_running_tasks() {
        let (master, handle) = start_master().await;
        let agent = register_agent(master, "us", 1).await;
        let requester = TestPeer::connect(master, None).await;

        let task_id = request_spawn(&requester, spawn_options("us", "Duel")).await;
        let _ = expect_launch(&agent).await;
        agent.send(&Packet::ProcessStarted { task_id, timestamp: timestamp_ms() }).await;
        requester.wait_status(task_id, SpawnStatus::ProcessStarted).await;

        agent.send(&Packet::Goodbye).await;
        requester.wait_status(task_id, SpawnStatus::Killed).await;

        let summary = handle.monitor().summary().await;
        assert_eq!(summary.agents, 0);
        handle.shutdown();
    }

    /// A request arriving before any agent waits and is placed once one registers
    #[tokio::test]
    async fn queued_request_is_placed_on_late_agent() {
        let (master, handle) = start_master().await;
        let requester = TestPeer::connect(master, None).await;

        let task_id = request_spawn(&requester, spawn_options("eu", "Late")).await;
        let agent = register_agent(master, "eu", 1).await;
        let (launched, _, _) = expect_launch(&agent).await;
        assert_eq!(launched, task_id);

        handle.shutdown();
    }

    /// The agent library launches a real process and reports its exit
    #[cfg(unix)]
    #[tokio::test]
    async fn agent_library_reports_process_exit() {
        let (master, handle) = start_master().await;
        let config = AgentConfig {
            master_addr: master.to_string(),
            credentials: Some(MASTER_KEY.to_string()),
            region: "eu".to_string(),
            max_processes: 1,
            executable: "true".into(),
            heartbeat_interval: Duration::from_millis(100),
            ..AgentConfig::default()
        };
        let mut spawner = SpawnerAgent::new(config).await.unwrap();
        let agent_task = tokio::spawn(async move { spawner.run().await });

        let monitor = handle.monitor();
        timeout(Duration::from_secs(3), async {
            while monitor.summary().await.agents == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("agent never registered");

        let requester = TestPeer::connect(master, None).await;
        let task_id = request_spawn(&requester, spawn_options("eu", "Short")).await;
        requester.wait_status(task_id, SpawnStatus::ProcessStarted).await;
        requester.wait_status(task_id, SpawnStatus::Killed).await;

        agent_task.abort();
        handle.shutdown();
    }
}

/// ROOM ACCESS TESTS
mod room_access_tests {
    use super::*;

    async fn register_room(owner: &TestPeer, options: RoomOptions) -> u32 {
        match owner.request(&Packet::RegisterRoom { request_id: 1, options }).await {
            Packet::RoomRegistered { room_id, .. } => room_id,
            other => panic!("Room registration failed: {:?}", other),
        }
    }

    /// Password check, single-use grants and owner-side validation
    #[tokio::test]
    async fn password_room_access_cycle() {
        let (master, handle) = start_master().await;
        let owner = TestPeer::connect(master, None).await;
        let player = TestPeer::connect(master, None).await;

        let room_id = register_room(
            &owner,
            RoomOptions {
                name: "Private".to_string(),
                address: "127.0.0.1:9000".to_string(),
                password: Some("hunter2".to_string()),
                ..Default::default()
            },
        )
        .await;

        let wrong = Packet::RequestAccess {
            request_id: 2,
            room_id,
            password: Some("guess".to_string()),
        };
        match player.request(&wrong).await {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
            other => panic!("Expected forbidden, got {:?}", other),
        }

        let right = Packet::RequestAccess {
            request_id: 3,
            room_id,
            password: Some("hunter2".to_string()),
        };
        let grant = match player.request(&right).await {
            Packet::AccessGranted { grant, .. } => grant,
            other => panic!("Expected grant, got {:?}", other),
        };
        assert_eq!(grant.address, "127.0.0.1:9000");

        let validate = Packet::ValidateAccess {
            request_id: 4,
            room_id,
            token: grant.token.clone(),
        };
        match owner.request(&validate).await {
            Packet::AccessValidated { peer_id, .. } => assert_eq!(peer_id, player.peer_id),
            other => panic!("Expected validation, got {:?}", other),
        }
        match owner.request(&validate).await {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidGrant),
            other => panic!("Expected invalid grant, got {:?}", other),
        }

        let rooms = handle.monitor().rooms().await;
        assert_eq!(rooms[0].players.len(), 1);
        handle.shutdown();
    }

    /// Only the owner may validate, and private rooms stay out of listings
    #[tokio::test]
    async fn validation_requires_owner() {
        let (master, handle) = start_master().await;
        let owner = TestPeer::connect(master, None).await;
        let player = TestPeer::connect(master, None).await;

        let room_id = register_room(
            &owner,
            RoomOptions {
                name: "Hidden".to_string(),
                is_public: false,
                ..Default::default()
            },
        )
        .await;

        match player
            .request(&Packet::ListRooms { request_id: 2, filters: Properties::new() })
            .await
        {
            Packet::RoomList { rooms, .. } => assert!(rooms.is_empty()),
            other => panic!("Expected room list, got {:?}", other),
        }

        let grant = match player
            .request(&Packet::RequestAccess { request_id: 3, room_id, password: None })
            .await
        {
            Packet::AccessGranted { grant, .. } => grant,
            other => panic!("Expected grant, got {:?}", other),
        };

        let validate = Packet::ValidateAccess {
            request_id: 4,
            room_id,
            token: grant.token,
        };
        match player.request(&validate).await {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
            other => panic!("Expected forbidden, got {:?}", other),
        }
        assert!(matches!(
            owner.request(&validate).await,
            Packet::AccessValidated { .. }
        ));

        handle.shutdown();
    }
}

/// IN-PROCESS LOBBY TESTS
mod lobby_tests {
    use super::*;

    /// Lobby code submits through the handle and sees the cancellation
    #[tokio::test]
    async fn lobby_submit_and_cancel() {
        let (_, handle) = start_master().await;

        let task_id = handle.submit("lobby", spawn_options("eu", "Lobby")).await.unwrap();
        let mut updates = handle.subscribe_task(task_id).await.unwrap();
        handle.cancel("lobby", task_id).await.unwrap();

        let change = timeout(Duration::from_secs(2), async {
            loop {
                let change = updates.recv().await.expect("status channel closed");
                if change.status.is_terminal() {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(change.task_id, task_id);
        assert_eq!(change.status, SpawnStatus::Aborted);

        handle.shutdown();
    }
}
