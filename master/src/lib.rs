//! # Spawn Master Library
//!
//! This library provides the master server of a game-server spawning
//! system. Worker hosts run a spawner agent that registers here and launches
//! game-server processes on request. The master decides where each process
//! runs, verifies the process when it calls back, and publishes the
//! resulting room so that players can find it and obtain access.
//!
//! ## Core Responsibilities
//!
//! ### Spawn Scheduling
//! Spawn requests are queued and placed on the least loaded agent of the
//! requested region. Requests that cannot be placed wait in submission order
//! and are retried on every queue tick until they are placed, cancelled, or
//! time out.
//!
//! ### Spawn Task Lifecycle
//! Every request becomes a spawn task that moves through
//! `queued → process-started → process-registered → finalized`, or ends
//! `aborted` / `killed`. Each task carries a single-use security code that
//! only the agent running the process ever sees; the process proves its
//! identity by presenting it.
//!
//! ### Rooms and Access
//! Finalized tasks become rooms. Rooms can also be registered directly by
//! externally managed game servers. Players request an access grant, a
//! short-lived single-use token, and hand it to the room process, which
//! redeems it with the master.
//!
//! ## Architecture Design
//!
//! ### Single Service Context
//! All orchestration state lives in one [`orchestrator::Orchestrator`] behind
//! an `Arc<RwLock<_>>`. Every mutation takes the write lock, so the
//! transitions of a task apply atomically and in order regardless of which
//! connection delivered them.
//!
//! ### UDP-Based Communication
//! Peers exchange bincode-encoded [`shared::Packet`] datagrams with the
//! master. Connection state is tracked per address with heartbeats and
//! timeouts; losing a peer triggers the same cleanup as an explicit goodbye.
//!
//! ## Module Organization
//!
//! ### Agents (`agents`, `regions`)
//! Registered spawners, their capacity and reservations, and the region
//! index used by placement.
//!
//! ### Scheduling (`scheduler`, `task`, `notify`)
//! The spawn queue, placement policy, task state machine, and status-change
//! fan-out.
//!
//! ### Rooms (`rooms`)
//! Room registry, listing filters, and the access broker.
//!
//! ### Network (`network`, `peers`, `auth`)
//! The UDP server loop, connected peers, and the authentication boundary.
//!
//! ### Monitoring (`monitor`)
//! Read-only snapshots for administrative tooling.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use master::auth::MasterKeyAuthenticator;
//! use master::config::MasterConfig;
//! use master::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), master::error::BoxError> {
//!     let config = MasterConfig::default();
//!     let auth = Arc::new(MasterKeyAuthenticator::new(Some("secret".to_string()), 0, 10));
//!     let mut server = Server::new(config, auth).await?;
//!
//!     // Lobby code running in the same process submits through a handle
//!     let lobby = server.handle();
//!     tokio::spawn(async move {
//!         let Ok(task_id) = lobby.submit("lobby", Default::default()).await else {
//!             return;
//!         };
//!         if let Ok(mut updates) = lobby.subscribe_task(task_id).await {
//!             while let Some(change) = updates.recv().await {
//!                 println!("task {} is now {}", change.task_id, change.status);
//!             }
//!         }
//!     });
//!
//!     server.run().await
//! }
//! ```
//!
//! The server uses an event-driven architecture with internal async tasks that handle:
//! - **Network Receiver**: Continuously listens for incoming packets
//! - **Network Sender**: Processes the outgoing packet queue
//! - **Timeout Checker**: Monitors peer health and removes silent connections
//! - **Main Loop**: Dispatches packets, relays status changes, and runs the queue tick

pub mod agents;
pub mod auth;
pub mod config;
pub mod error;
pub mod monitor;
pub mod network;
pub mod notify;
pub mod orchestrator;
pub mod peers;
pub mod regions;
pub mod rooms;
pub mod scheduler;
pub mod task;
