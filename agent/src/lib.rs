//! # Spawner Agent Library
//!
//! The agent runs on a worker host. It registers with the master as a
//! spawner for one region, launches a game-server process for every launch
//! instruction it receives, and reports back when processes start and exit.
//!
//! ## Process Handshake
//!
//! Every launch carries a task id and a single-use security code. The agent
//! passes both to the process on its command line:
//!
//! ```text
//! <executable> [extra args] --master <addr> --task-id <id> --code <code> [--opt KEY=VALUE]...
//! ```
//!
//! The process then connects to the master itself, presents the code, and
//! reports its address once ready. The `room-stub` binary in this crate is
//! a minimal process that does exactly that.
//!
//! ## Capacity
//!
//! The agent declines launches beyond its own process limit and sends a
//! capacity report whenever a process exits, so the master never counts on
//! a slot that is still occupied.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use agent::config::AgentConfig;
//! use agent::network::SpawnerAgent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig {
//!         region: "eu".to_string(),
//!         credentials: Some("secret".to_string()),
//!         ..AgentConfig::default()
//!     };
//!     let mut agent = SpawnerAgent::new(config).await?;
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod launcher;
pub mod network;
