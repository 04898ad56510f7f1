//! Minimal game server used to exercise the spawn handshake.
//!
//! It registers with the master using the security code it was launched
//! with, reports itself ready, then stays connected until its lifetime ends
//! or it is interrupted.

use agent::config::parse_key_value;
use clap::Parser;
use shared::{
    decode, encode, timestamp_ms, FinalizationData, Packet, Properties, TaskId, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Master address handed over by the agent
    #[arg(long)]
    master: String,

    /// Spawn task this process belongs to
    #[arg(long)]
    task_id: TaskId,

    /// Security code for the task
    #[arg(long)]
    code: String,

    /// Launch option as KEY=VALUE (repeatable)
    #[arg(long = "opt", value_parser = parse_key_value)]
    options: Vec<(String, String)>,

    /// Address players should connect to
    #[arg(long, default_value = "127.0.0.1:7777")]
    address: String,

    /// Seconds to stay up; 0 runs until Ctrl+C
    #[arg(long, default_value = "0")]
    lifetime: u64,
}

async fn send(socket: &UdpSocket, packet: &Packet, master: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&encode(packet)?, master).await?;
    Ok(())
}

// Next packet from the master that is not a heartbeat
async fn reply(socket: &UdpSocket, buf: &mut [u8]) -> Result<Packet, Box<dyn std::error::Error>> {
    loop {
        let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(buf)).await??;
        match decode(&buf[..len]) {
            Ok(Packet::Heartbeat { .. }) => continue,
            Ok(packet) => return Ok(packet),
            Err(e) => println!("Failed to decode packet: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let master: SocketAddr = args.master.parse()?;
    let launch_options: Properties = args.options.into_iter().collect();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Room stub for task {} bound to {}", args.task_id, socket.local_addr()?);

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    let hello = Packet::Hello {
        protocol_version: PROTOCOL_VERSION,
        credentials: None,
    };
    send(&socket, &hello, master).await?;
    match reply(&socket, &mut buf).await? {
        Packet::Welcome { peer_id, .. } => println!("Connected as peer {}", peer_id),
        other => return Err(format!("Expected welcome but got: {:?}", other).into()),
    }

    let register = Packet::RegisterSpawnedProcess {
        request_id: 1,
        task_id: args.task_id,
        code: args.code,
    };
    send(&socket, &register, master).await?;
    let options = match reply(&socket, &mut buf).await? {
        Packet::SpawnedProcessRegistered { options, .. } => options,
        other => return Err(format!("Registration failed: {:?}", other).into()),
    };
    if options != launch_options {
        println!("Master options differ from the command line, using the master's");
    }
    println!("Registered task {} with {} options", args.task_id, options.len());

    let complete = Packet::CompleteSpawn {
        request_id: 2,
        task_id: args.task_id,
        data: FinalizationData {
            address: args.address.clone(),
            room_id: None,
            payload: Properties::new(),
        },
    };
    send(&socket, &complete, master).await?;
    match reply(&socket, &mut buf).await? {
        Packet::SpawnCompleted { room_id, .. } => {
            println!("Room {} is open at {}", room_id, args.address)
        }
        other => return Err(format!("Finalization failed: {:?}", other).into()),
    }

    let mut heartbeat = interval(Duration::from_secs(2));
    let lifetime_secs = args.lifetime;
    let lifetime = async move {
        if lifetime_secs > 0 {
            sleep(Duration::from_secs(lifetime_secs)).await;
        } else {
            let _ = tokio::signal::ctrl_c().await;
        }
    };
    tokio::pin!(lifetime);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                send(&socket, &Packet::Heartbeat { timestamp: timestamp_ms() }, master).await?;
            }
            result = socket.recv_from(&mut buf) => {
                if let Ok((len, _)) = result {
                    if let Ok(Packet::Goodbye | Packet::Rejected { .. }) = decode(&buf[..len]) {
                        println!("Master closed the session");
                        return Ok(());
                    }
                }
            }
            _ = &mut lifetime => break,
        }
    }

    println!("Room stub for task {} shutting down", args.task_id);
    send(&socket, &Packet::Goodbye, master).await?;
    Ok(())
}
