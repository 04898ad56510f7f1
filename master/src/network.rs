//! Master network layer handling UDP communications and the queue tick

use crate::auth::{Authenticator, Identity, Requester};
use crate::config::MasterConfig;
use crate::error::{BoxError, OrchestratorError};
use crate::monitor::Monitor;
use crate::notify::StatusChange;
use crate::orchestrator::Orchestrator;
use crate::peers::{Peer, PeerManager};
use crate::scheduler::Outbound;
use log::{debug, error, info, warn};
use shared::{
    decode, encode, FinalizationData, Packet, PeerId, Properties, TaskId, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    PeerTimeout { peer_id: PeerId },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutgoingMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    SendToPeer { packet: Packet, peer_id: PeerId },
}

/// Wire packet carrying an orchestrator instruction to a spawner.
fn outbound_packet(outbound: Outbound) -> OutgoingMessage {
    match outbound {
        Outbound::Launch {
            agent_peer,
            task_id,
            code,
            options,
            ..
        } => OutgoingMessage::SendToPeer {
            packet: Packet::LaunchProcess {
                task_id,
                code,
                options,
            },
            peer_id: agent_peer,
        },
        Outbound::Kill {
            agent_peer,
            task_id,
        } => OutgoingMessage::SendToPeer {
            packet: Packet::KillProcess { task_id },
            peer_id: agent_peer,
        },
    }
}

fn dispatch(outgoing_tx: &mpsc::UnboundedSender<OutgoingMessage>, outbound: Vec<Outbound>) {
    for message in outbound.into_iter().map(outbound_packet) {
        if let Err(e) = outgoing_tx.send(message) {
            error!("Failed to queue spawner instruction: {}", e);
        }
    }
}

/// In-process access for lobby and matchmaker modules running next to the
/// master. Spawner instructions produced by these calls are delivered by
/// the server's sender task.
#[derive(Clone)]
pub struct ServerHandle {
    orchestrator: Arc<RwLock<Orchestrator>>,
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub async fn submit(&self, module: &str, options: Properties) -> Result<TaskId, OrchestratorError> {
        let requester = Requester::Internal(module.to_string());
        let (task_id, outbound) = self.orchestrator.write().await.submit(requester, options)?;
        dispatch(&self.outgoing_tx, outbound);
        Ok(task_id)
    }

    pub async fn cancel(&self, module: &str, task_id: TaskId) -> Result<(), OrchestratorError> {
        let requester = Requester::Internal(module.to_string());
        self.orchestrator.write().await.cancel(&requester, task_id)
    }

    pub async fn kill(&self, module: &str, task_id: TaskId) -> Result<(), OrchestratorError> {
        let requester = Requester::Internal(module.to_string());
        let outbound = self.orchestrator.write().await.kill(&requester, task_id)?;
        dispatch(&self.outgoing_tx, outbound);
        Ok(())
    }

    pub async fn finalization(&self, module: &str, task_id: TaskId) -> Result<FinalizationData, OrchestratorError> {
        let requester = Requester::Internal(module.to_string());
        self.orchestrator.read().await.finalization(&requester, task_id)
    }

    pub async fn subscribe_task(
        &self,
        task_id: TaskId,
    ) -> Result<mpsc::UnboundedReceiver<StatusChange>, OrchestratorError> {
        self.orchestrator.write().await.subscribe_task(task_id)
    }

    pub async fn subscribe_all(&self) -> mpsc::UnboundedReceiver<StatusChange> {
        self.orchestrator.write().await.subscribe_all()
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(Arc::clone(&self.orchestrator))
    }

    /// Asks the server loop to stop. Returns false if it already stopped.
    pub fn shutdown(&self) -> bool {
        self.server_tx.send(ServerMessage::Shutdown).is_ok()
    }
}

/// Master server coordinating peers and the orchestrator
pub struct Server {
    socket: Arc<UdpSocket>,
    peers: Arc<RwLock<PeerManager>>,
    orchestrator: Arc<RwLock<Orchestrator>>,
    authenticator: Arc<dyn Authenticator>,
    queue_tick: Duration,
    peer_timeout: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
    outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    status_rx: mpsc::UnboundedReceiver<StatusChange>,
}

impl Server {
    pub async fn new(config: MasterConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self, BoxError> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_address).await?);
        info!("Master listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let queue_tick = config.queue_tick;
        let peer_timeout = config.peer_timeout;
        let peers = PeerManager::new(config.max_peers);
        let mut orchestrator = Orchestrator::new(config);
        let status_rx = orchestrator.subscribe_all();

        Ok(Server {
            socket,
            peers: Arc::new(RwLock::new(peers)),
            orchestrator: Arc::new(RwLock::new(orchestrator)),
            authenticator,
            queue_tick,
            peer_timeout,
            server_tx,
            server_rx,
            outgoing_tx,
            outgoing_rx,
            status_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            orchestrator: Arc::clone(&self.orchestrator),
            outgoing_tx: self.outgoing_tx.clone(),
            server_tx: self.server_tx.clone(),
        }
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(Arc::clone(&self.orchestrator))
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = decode(&buffer[..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                debug!("Main loop gone, receiver stopping: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        let mut outgoing_rx = std::mem::replace(&mut self.outgoing_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let (packet, addr) = match message {
                    OutgoingMessage::SendPacket { packet, addr } => (packet, addr),
                    OutgoingMessage::SendToPeer { packet, peer_id } => {
                        let addr = peers.read().await.addr_of(peer_id);
                        match addr {
                            Some(addr) => (packet, addr),
                            None => {
                                debug!("Dropping packet for departed peer {}", peer_id);
                                continue;
                            }
                        }
                    }
                };

                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that monitors peer timeouts
    fn spawn_timeout_checker(&self) {
        let peers = Arc::clone(&self.peers);
        let server_tx = self.server_tx.clone();
        let timeout = self.peer_timeout;
        let period = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                interval.tick().await;

                let timed_out = peers.write().await.check_timeouts(timeout);

                for peer_id in timed_out {
                    info!("Peer {} timed out", peer_id);
                    if server_tx.send(ServerMessage::PeerTimeout { peer_id }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) -> Result<(), BoxError> {
        let data = encode(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outgoing_tx.send(OutgoingMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_to_peer(&self, packet: Packet, peer_id: PeerId) {
        if let Err(e) = self.outgoing_tx.send(OutgoingMessage::SendToPeer { packet, peer_id }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Sends the response to a request, or an `Error` packet on failure
    fn respond(&self, addr: SocketAddr, request_id: u32, result: Result<Packet, OrchestratorError>) {
        let packet = match result {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Request {} from {} failed: {}", request_id, addr, e);
                Packet::Error {
                    request_id,
                    code: e.code(),
                    message: e.to_string(),
                }
            }
        };
        self.send_packet(packet, addr);
    }

    /// Runs the disconnect cascade for a peer that is already gone
    async fn peer_lost(&self, peer_id: PeerId) {
        let outbound = self.orchestrator.write().await.peer_lost(peer_id);
        dispatch(&self.outgoing_tx, outbound);
    }

    async fn disconnect(&self, peer_id: PeerId) {
        let removed = self.peers.write().await.remove_peer(peer_id);
        if removed.is_some() {
            self.peer_lost(peer_id).await;
        }
    }

    async fn handle_hello(&self, protocol_version: u32, credentials: Option<String>, addr: SocketAddr) {
        info!("Peer connecting from {} (protocol {})", addr, protocol_version);

        // A new hello from a known address replaces the old session
        let existing = self
            .peers
            .read()
            .await
            .find_peer_by_addr(addr)
            .map(|peer| peer.id);
        if let Some(existing_id) = existing {
            info!("Replacing session of peer {} from {}", existing_id, addr);
            self.disconnect(existing_id).await;
        }

        if protocol_version != PROTOCOL_VERSION {
            let reason = "Protocol version mismatch".to_string();
            self.send_packet(Packet::Rejected { reason }, addr);
            return;
        }

        let mut peers = self.peers.write().await;
        if peers.is_full() {
            let reason = "Server full".to_string();
            self.send_packet(Packet::Rejected { reason }, addr);
            return;
        }

        let peer_id = peers.next_id();
        let Some(identity) = self
            .authenticator
            .authenticate(peer_id, addr, credentials.as_deref())
        else {
            let reason = "Authentication failed".to_string();
            self.send_packet(Packet::Rejected { reason }, addr);
            return;
        };

        let privilege = identity.privilege;
        if peers.add_peer(addr, identity) {
            self.send_packet(Packet::Welcome { peer_id, privilege }, addr);
        } else {
            let reason = "Server full".to_string();
            self.send_packet(Packet::Rejected { reason }, addr);
        }
    }

    /// Processes incoming packets and updates orchestration state
    async fn handle_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Packet::Hello {
            protocol_version,
            credentials,
        } = packet
        {
            self.handle_hello(protocol_version, credentials, addr).await;
            return;
        }

        let peer = {
            let mut peers = self.peers.write().await;
            let peer = peers.find_peer_by_addr(addr).cloned();
            if let Some(peer) = &peer {
                peers.touch(peer.id);
            }
            peer
        };
        let Some(peer) = peer else {
            debug!("Packet from unknown address {}", addr);
            let reason = "Not connected".to_string();
            self.send_packet(Packet::Rejected { reason }, addr);
            return;
        };

        self.handle_peer_packet(&peer, packet).await;
    }

    async fn handle_peer_packet(&self, peer: &Peer, packet: Packet) {
        let addr = peer.addr;
        let peer_id = peer.id;
        let requester = Requester::Peer(peer.identity.clone());

        match packet {
            Packet::Heartbeat { timestamp } => {
                self.send_packet(Packet::Heartbeat { timestamp }, addr);
            }

            Packet::Goodbye => {
                self.disconnect(peer_id).await;
            }

            // Spawner agents
            Packet::RegisterSpawner { request_id, info } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .register_agent(&peer.identity, info)
                    .map(|agent_id| Packet::SpawnerRegistered {
                        request_id,
                        agent_id,
                    });
                self.respond(addr, request_id, result);
            }

            Packet::CapacityReport { running, timestamp } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .report_capacity(peer_id, running, timestamp);
                match result {
                    Ok(outbound) => dispatch(&self.outgoing_tx, outbound),
                    Err(e) => warn!("Capacity report from peer {} rejected: {}", peer_id, e),
                }
            }

            Packet::ProcessStarted { task_id, timestamp } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .process_started(peer_id, task_id, timestamp);
                match result {
                    Ok(outbound) => dispatch(&self.outgoing_tx, outbound),
                    Err(e) => warn!("Start of task {} from peer {} rejected: {}", task_id, peer_id, e),
                }
            }

            Packet::LaunchDeclined { task_id, reason } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .launch_declined(peer_id, task_id, &reason);
                if let Err(e) = result {
                    warn!("Decline of task {} from peer {} rejected: {}", task_id, peer_id, e);
                }
            }

            Packet::ProcessExited { task_id } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .process_exited(peer_id, task_id);
                if let Err(e) = result {
                    debug!("Exit of task {} from peer {} ignored: {}", task_id, peer_id, e);
                }
            }

            // Spawn requesters
            Packet::RequestSpawn {
                request_id,
                options,
            } => {
                let result = self.orchestrator.write().await.submit(requester, options);
                let result = result.map(|(task_id, outbound)| {
                    dispatch(&self.outgoing_tx, outbound);
                    Packet::SpawnAccepted {
                        request_id,
                        task_id,
                    }
                });
                self.respond(addr, request_id, result);
            }

            Packet::CancelSpawn {
                request_id,
                task_id,
            } => {
                let result = self.orchestrator.write().await.cancel(&requester, task_id);
                self.respond(addr, request_id, result.map(|_| Packet::Done { request_id }));
            }

            Packet::KillSpawn {
                request_id,
                task_id,
            } => {
                let result = self.orchestrator.write().await.kill(&requester, task_id);
                let result = result.map(|outbound| {
                    dispatch(&self.outgoing_tx, outbound);
                    Packet::Done { request_id }
                });
                self.respond(addr, request_id, result);
            }

            Packet::GetFinalization {
                request_id,
                task_id,
            } => {
                let result = self
                    .orchestrator
                    .read()
                    .await
                    .finalization(&requester, task_id)
                    .map(|data| Packet::Finalization {
                        request_id,
                        task_id,
                        data,
                    });
                self.respond(addr, request_id, result);
            }

            // Spawned processes
            Packet::RegisterSpawnedProcess {
                request_id,
                task_id,
                code,
            } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .register_process(peer_id, task_id, &code)
                    .map(|options| Packet::SpawnedProcessRegistered {
                        request_id,
                        task_id,
                        options,
                    });
                self.respond(addr, request_id, result);
            }

            Packet::CompleteSpawn {
                request_id,
                task_id,
                data,
            } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .finalize(peer_id, task_id, data)
                    .map(|room_id| Packet::SpawnCompleted {
                        request_id,
                        task_id,
                        room_id,
                    });
                self.respond(addr, request_id, result);
            }

            // Rooms
            Packet::RegisterRoom {
                request_id,
                options,
            } => {
                let room_id = self.orchestrator.write().await.register_room(peer_id, options);
                self.send_packet(Packet::RoomRegistered { request_id, room_id }, addr);
            }

            Packet::UpdateRoom {
                request_id,
                room_id,
                options,
            } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .update_room(peer_id, room_id, options);
                self.respond(addr, request_id, result.map(|_| Packet::Done { request_id }));
            }

            Packet::DestroyRoom {
                request_id,
                room_id,
            } => {
                let result = self.orchestrator.write().await.destroy_room(peer_id, room_id);
                self.respond(addr, request_id, result.map(|_| Packet::Done { request_id }));
            }

            Packet::RequestAccess {
                request_id,
                room_id,
                password,
            } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .request_access(&peer.identity, room_id, password.as_deref())
                    .map(|grant| Packet::AccessGranted { request_id, grant });
                self.respond(addr, request_id, result);
            }

            Packet::ValidateAccess {
                request_id,
                room_id,
                token,
            } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .validate_access(peer_id, room_id, &token, Instant::now())
                    .map(|identity: Identity| Packet::AccessValidated {
                        request_id,
                        username: identity.username,
                        peer_id: identity.peer_id,
                    });
                self.respond(addr, request_id, result);
            }

            Packet::PlayerLeft { room_id, username } => {
                let result = self
                    .orchestrator
                    .write()
                    .await
                    .player_left(peer_id, room_id, &username);
                if let Err(e) = result {
                    warn!("Player-left from peer {} rejected: {}", peer_id, e);
                }
            }

            Packet::ListRooms {
                request_id,
                filters,
            } => {
                let rooms = self.orchestrator.read().await.list_rooms(&filters);
                self.send_packet(Packet::RoomList { request_id, rooms }, addr);
            }

            Packet::ListRegions { request_id } => {
                let regions = self.orchestrator.read().await.regions();
                self.send_packet(Packet::RegionList { request_id, regions }, addr);
            }

            _ => {
                warn!("Unexpected packet type from peer {} at {}", peer_id, addr);
            }
        }
    }

    /// Forwards a task status change to the peer that requested the task
    fn forward_status(&self, change: StatusChange) {
        let Some(peer_id) = change.requester else {
            return;
        };
        let packet = Packet::SpawnStatusChanged {
            task_id: change.task_id,
            status: change.status,
            reason: change.reason,
        };
        self.send_to_peer(packet, peer_id);
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), BoxError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.queue_tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Master started successfully");

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::PeerTimeout { peer_id }) => {
                            self.peer_lost(peer_id).await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Master shutting down");
                            break;
                        }
                    }
                },

                // Relay task status changes to requesters
                Some(change) = self.status_rx.recv() => {
                    self.forward_status(change);
                },

                // Handle queue tick events
                _ = tick_interval.tick() => {
                    let outbound = self.orchestrator.write().await.tick(Instant::now());
                    if !outbound.is_empty() {
                        debug!("Queue tick placed {} tasks", outbound.len());
                    }
                    dispatch(&self.outgoing_tx, outbound);
                },
            }
        }

        Ok(())
    }
}
