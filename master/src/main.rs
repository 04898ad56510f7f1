use clap::Parser;
use log::{error, info};
use master::auth::MasterKeyAuthenticator;
use master::config::{parse_region, MasterConfig, SchedulerConfig};
use master::error::BoxError;
use master::network::Server;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = shared::DEFAULT_MASTER_PORT)]
    port: u16,
    /// Queue tick interval in milliseconds
    #[clap(long, default_value = "1000")]
    tick_ms: u64,
    /// Seconds a spawn request may wait in the queue
    #[clap(long, default_value = "60")]
    queue_timeout: u64,
    /// Maximum number of queued spawn requests
    #[clap(long, default_value = "1000")]
    max_queue: usize,
    /// Seconds a spawner has to acknowledge a launch
    #[clap(long, default_value = "10")]
    offer_timeout: u64,
    /// Seconds finished tasks stay queryable
    #[clap(long, default_value = "300")]
    task_retention: u64,
    /// Process limit for spawners that do not declare one
    #[clap(long, default_value = "5")]
    default_max_processes: u32,
    /// Privilege needed to register a spawner
    #[clap(long, default_value = "1")]
    min_register_privilege: u32,
    /// Privilege needed to request a spawn
    #[clap(long, default_value = "0")]
    min_spawn_privilege: u32,
    /// Privilege needed to kill tasks; also granted to master-key holders
    #[clap(long, default_value = "10")]
    admin_privilege: u32,
    /// Shared key for trusted peers (spawners, admin tools)
    #[clap(long)]
    master_key: Option<String>,
    /// Seconds an access grant stays valid
    #[clap(long, default_value = "10")]
    grant_ttl: u64,
    /// Seconds of silence before a peer is dropped
    #[clap(long, default_value = "10")]
    peer_timeout: u64,
    /// Maximum number of connected peers
    #[clap(long, default_value = "4096")]
    max_peers: usize,
    /// Region with its representative address, as NAME=ADDRESS (repeatable)
    #[clap(long = "region", value_parser = parse_region)]
    regions: Vec<(String, String)>,
}

impl From<Args> for MasterConfig {
    fn from(args: Args) -> Self {
        MasterConfig {
            bind_address: format!("{}:{}", args.host, args.port),
            queue_tick: Duration::from_millis(args.tick_ms.max(1)),
            peer_timeout: Duration::from_secs(args.peer_timeout),
            max_peers: args.max_peers,
            default_max_processes: args.default_max_processes,
            min_register_privilege: args.min_register_privilege,
            admin_privilege: args.admin_privilege,
            grant_ttl: Duration::from_secs(args.grant_ttl),
            regions: args.regions.into_iter().collect(),
            scheduler: SchedulerConfig {
                min_spawn_privilege: args.min_spawn_privilege,
                queue_timeout: Duration::from_secs(args.queue_timeout),
                max_queue_len: args.max_queue,
                offer_timeout: Duration::from_secs(args.offer_timeout),
                task_retention: Duration::from_secs(args.task_retention),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let args = Args::parse();
    if args.master_key.is_none() {
        info!("No master key configured, spawners cannot authenticate");
    }
    let authenticator = Arc::new(MasterKeyAuthenticator::new(
        args.master_key.clone(),
        0,
        args.admin_privilege,
    ));

    let mut server = Server::new(args.into(), authenticator).await?;
    let handle = server.handle();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Master stopped with error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
        }
    }

    Ok(())
}
