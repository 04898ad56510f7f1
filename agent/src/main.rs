use agent::config::{parse_key_value, AgentConfig};
use agent::network::SpawnerAgent;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Master address to register with
    #[arg(short = 'm', long, default_value = "127.0.0.1:5000")]
    master: String,

    /// Master key for authenticating as a trusted peer
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Region this host serves
    #[arg(short = 'r', long, default_value = "")]
    region: String,

    /// Maximum number of concurrent processes (0 = master default)
    #[arg(short = 'n', long, default_value = "5")]
    max_processes: u32,

    /// Game server executable to launch
    #[arg(short = 'e', long, default_value = "room-stub")]
    executable: PathBuf,

    /// Extra argument passed before the generated ones (repeatable)
    #[arg(long = "arg")]
    extra_args: Vec<String>,

    /// Capability tag as KEY=VALUE (repeatable)
    #[arg(short = 'c', long = "capability", value_parser = parse_key_value)]
    capabilities: Vec<(String, String)>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "2000")]
    heartbeat_ms: u64,
}

impl From<Args> for AgentConfig {
    fn from(args: Args) -> Self {
        AgentConfig {
            master_addr: args.master,
            credentials: args.key,
            region: args.region,
            max_processes: args.max_processes,
            capabilities: args.capabilities.into_iter().collect(),
            executable: args.executable,
            extra_args: args.extra_args,
            heartbeat_interval: Duration::from_millis(args.heartbeat_ms.max(100)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting spawner agent...");
    info!("Master: {}", args.master);
    info!("Executable: {}", args.executable.display());
    if args.key.is_none() {
        info!("No master key given, registration needs anonymous privilege");
    }

    let mut agent = SpawnerAgent::new(args.into()).await?;

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent stopped: {}", e);
                agent.shutdown().await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping processes...");
        }
    }

    agent.shutdown().await;
    Ok(())
}
