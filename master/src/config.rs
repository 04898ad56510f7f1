//! Runtime configuration for the master server.
//!
//! `main.rs` parses command-line flags into [`MasterConfig`]; tests and
//! embedders build it directly, usually starting from `Default`.

use std::collections::BTreeMap;
use std::time::Duration;

/// Settings consumed by the spawn scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum privilege for untrusted peers submitting spawn requests
    pub min_spawn_privilege: u32,
    /// How long a task may wait in the queue before it is aborted
    pub queue_timeout: Duration,
    /// Queue length beyond which unplaceable requests are refused
    pub max_queue_len: usize,
    /// How long an agent has to acknowledge a launch before the offer is withdrawn
    pub offer_timeout: Duration,
    /// How long terminal tasks stay queryable
    pub task_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_spawn_privilege: 0,
            queue_timeout: Duration::from_secs(60),
            max_queue_len: 1000,
            offer_timeout: Duration::from_secs(10),
            task_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_address: String,
    /// Period of the queue tick that retries placement and expires entries
    pub queue_tick: Duration,
    /// Peers silent for longer than this are disconnected
    pub peer_timeout: Duration,
    pub max_peers: usize,
    /// Used when an agent registers without declaring its capacity
    pub default_max_processes: u32,
    pub min_register_privilege: u32,
    /// Privilege required to kill tasks administratively
    pub admin_privilege: u32,
    /// Lifetime of issued room access grants
    pub grant_ttl: Duration,
    /// Region name to representative address, for latency probing
    pub regions: BTreeMap<String, String>,
    pub scheduler: SchedulerConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{}", shared::DEFAULT_MASTER_PORT),
            queue_tick: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(10),
            max_peers: 4096,
            default_max_processes: 5,
            min_register_privilege: 1,
            admin_privilege: 10,
            grant_ttl: Duration::from_secs(10),
            regions: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Parses a `name=address` region declaration.
pub fn parse_region(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, address)) if !name.trim().is_empty() && !address.trim().is_empty() => {
            Ok((name.trim().to_string(), address.trim().to_string()))
        }
        _ => Err(format!("expected NAME=ADDRESS, got '{}'", value)),
    }
}
