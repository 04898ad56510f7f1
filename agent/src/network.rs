//! Connection between a spawner agent and the master
//!
//! The agent says hello, registers itself as a spawner once welcomed, and
//! then serves launch and kill instructions until the master rejects it or
//! the caller stops the run loop. Hellos are repeated on every heartbeat
//! tick until a welcome arrives.

use crate::config::AgentConfig;
use crate::launcher::{Launcher, ProcessEvent};
use log::{debug, error, info, warn};
use shared::{
    decode, encode, timestamp_ms, AgentId, ErrorCode, Packet, PeerId, Properties, SpawnerInfo,
    TaskId, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

const REGISTER_REQUEST_ID: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid master address '{0}'")]
    InvalidAddress(String),

    #[error("master rejected the connection: {0}")]
    Rejected(String),

    #[error("spawner registration failed ({code:?}): {message}")]
    Registration { code: ErrorCode, message: String },

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub struct SpawnerAgent {
    socket: UdpSocket,
    master_addr: SocketAddr,
    config: AgentConfig,
    peer_id: Option<PeerId>,
    agent_id: Option<AgentId>,
    launcher: Launcher,
    events_rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl SpawnerAgent {
    pub async fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let master_addr: SocketAddr = config
            .master_addr
            .parse()
            .map_err(|_| AgentError::InvalidAddress(config.master_addr.clone()))?;
        let bind_addr = if master_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;

        let (launcher, events_rx) = Launcher::new(
            &config.executable,
            config.extra_args.clone(),
            config.master_addr.clone(),
        );

        Ok(SpawnerAgent {
            socket,
            master_addr,
            config,
            peer_id: None,
            agent_id: None,
            launcher,
            events_rx,
        })
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
    }

    pub fn running(&self) -> u32 {
        self.launcher.running()
    }

    async fn connect(&mut self) -> Result<(), AgentError> {
        info!("Connecting to master at {}...", self.master_addr);

        let packet = Packet::Hello {
            protocol_version: PROTOCOL_VERSION,
            credentials: self.config.credentials.clone(),
        };
        self.send_packet(&packet).await
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), AgentError> {
        let data = encode(packet)?;
        self.socket.send_to(&data, self.master_addr).await?;
        Ok(())
    }

    async fn register(&mut self) -> Result<(), AgentError> {
        let info = SpawnerInfo {
            region: self.config.region.clone(),
            max_processes: self.config.max_processes,
            capabilities: self.config.capabilities.clone(),
        };
        self.send_packet(&Packet::RegisterSpawner {
            request_id: REGISTER_REQUEST_ID,
            info,
        })
        .await
    }

    async fn report_capacity(&self) -> Result<(), AgentError> {
        self.send_packet(&Packet::CapacityReport {
            running: self.launcher.running(),
            timestamp: timestamp_ms(),
        })
        .await
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), AgentError> {
        match packet {
            Packet::Welcome { peer_id, privilege } => {
                if self.peer_id.is_some() {
                    return Ok(());
                }
                info!("Connected as peer {} (privilege {})", peer_id, privilege);
                self.peer_id = Some(peer_id);
                self.register().await?;
            }
            Packet::Rejected { reason } => {
                if self.peer_id.take().is_some() || self.agent_id.is_some() {
                    warn!("Master dropped the session: {}", reason);
                }
                return Err(AgentError::Rejected(reason));
            }
            Packet::SpawnerRegistered { agent_id, .. } => {
                info!(
                    "Registered as agent {} in region '{}'",
                    agent_id, self.config.region
                );
                self.agent_id = Some(agent_id);
                self.report_capacity().await?;
            }
            Packet::Error {
                request_id: REGISTER_REQUEST_ID,
                code,
                message,
            } if self.agent_id.is_none() => {
                return Err(AgentError::Registration { code, message });
            }
            Packet::Error { code, message, .. } => {
                warn!("Master reported {:?}: {}", code, message);
            }
            Packet::LaunchProcess {
                task_id,
                code,
                options,
            } => {
                self.launch(task_id, &code, &options).await?;
            }
            Packet::KillProcess { task_id } => {
                if self.launcher.kill(task_id) {
                    info!("Killing process of task {}", task_id);
                } else {
                    debug!("Kill for task {} with no running process", task_id);
                }
            }
            Packet::Heartbeat { .. } => {}
            Packet::Goodbye => {
                warn!("Master closed the session");
                self.peer_id = None;
                self.agent_id = None;
            }
            other => {
                debug!("Ignoring unexpected packet: {:?}", other);
            }
        }
        Ok(())
    }

    async fn launch(&mut self, task_id: TaskId, code: &str, options: &Properties) -> Result<(), AgentError> {
        let limit = self.config.max_processes;
        if limit > 0 && self.launcher.running() >= limit {
            warn!("Declining task {}: at capacity", task_id);
            return self
                .send_packet(&Packet::LaunchDeclined {
                    task_id,
                    reason: "at capacity".to_string(),
                })
                .await;
        }

        match self.launcher.launch(task_id, code, options) {
            Ok(()) => {
                self.send_packet(&Packet::ProcessStarted {
                    task_id,
                    timestamp: timestamp_ms(),
                })
                .await
            }
            Err(e) => {
                error!("Failed to launch task {}: {}", task_id, e);
                self.send_packet(&Packet::LaunchDeclined {
                    task_id,
                    reason: e.to_string(),
                })
                .await
            }
        }
    }

    async fn handle_event(&mut self, event: ProcessEvent) -> Result<(), AgentError> {
        match event {
            ProcessEvent::Exited { task_id, code } => {
                info!("Process of task {} exited with {:?}", task_id, code);
                self.launcher.exited(task_id);
                self.send_packet(&Packet::ProcessExited { task_id }).await?;
                self.report_capacity().await?;
            }
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<(), AgentError> {
        // The first tick fires immediately and sends the hello
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => {
                            if addr != self.master_addr {
                                debug!("Ignoring datagram from {}", addr);
                                continue;
                            }
                            match decode(&buffer[..len]) {
                                Ok(packet) => self.handle_packet(packet).await?,
                                Err(e) => warn!("Failed to decode packet: {}", e),
                            }
                        }
                        Err(e) => {
                            error!("Failed to receive packet: {}", e);
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await?;
                }

                _ = heartbeat_interval.tick() => {
                    if self.peer_id.is_none() {
                        self.connect().await?;
                    } else {
                        self.send_packet(&Packet::Heartbeat { timestamp: timestamp_ms() }).await?;
                    }
                }
            }
        }
    }

    /// Stops every running process and says goodbye to the master.
    pub async fn shutdown(&mut self) {
        self.launcher.kill_all();
        if self.peer_id.take().is_some() {
            if let Err(e) = self.send_packet(&Packet::Goodbye).await {
                warn!("Failed to send goodbye: {}", e);
            }
        }
        self.agent_id = None;
    }
}
