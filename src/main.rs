use std::io::Write as _;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use meshkit::{Mesh, MeshEvents, MeshSettings, Peer};

#[derive(Clone, Debug)]
struct PeerArg {
    host: String,
    port: u16,
}

impl FromStr for PeerArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .context("peer must be HOST:PORT")?;
        let port: u16 = port.parse().context("invalid port")?;
        Ok(PeerArg {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "meshkit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local endpoint other nodes dial and this node listens on.
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,

    /// Initial peers; more can be added interactively.
    #[arg(short, long, value_name = "HOST:PORT")]
    peer: Vec<PeerArg>,

    /// Hex-encoded 16-byte preshared key gating connections.
    #[arg(long, value_name = "HEX")]
    psk: Option<String>,

    /// Reconnect interval in milliseconds.
    #[arg(long, default_value = "1000")]
    reconnect_ms: u64,
}

struct ConsoleEvents;

#[async_trait]
impl MeshEvents for ConsoleEvents {
    async fn on_peer_connected(&self, peer: &Peer) -> bool {
        println!("*** connected to {peer}");
        true
    }

    async fn on_peer_disconnected(&self, peer: &Peer) -> bool {
        println!("*** disconnected from {peer}");
        true
    }

    async fn on_async_message(&self, peer: &Peer, payload: Vec<u8>) -> bool {
        println!("[{peer}] {}", String::from_utf8_lossy(&payload));
        true
    }

    async fn on_sync_message(&self, peer: &Peer, payload: Vec<u8>) -> Vec<u8> {
        println!("[{peer} sync] {}", String::from_utf8_lossy(&payload));
        b"received your message!".to_vec()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = MeshSettings::default();
    settings.reconnect_interval = Duration::from_millis(args.reconnect_ms);
    if let Some(psk) = &args.psk {
        settings.preshared_key = Some(hex::decode(psk).context("invalid hex preshared key")?);
    }

    let local = Peer::new(args.bind.ip().to_string(), args.bind.port());
    let mesh = Mesh::new(local, settings)?;
    mesh.set_events(Arc::new(ConsoleEvents));

    for p in &args.peer {
        mesh.add_peer(Peer::new(p.host.clone(), p.port));
    }

    mesh.start().await?;
    info!(bind = %args.bind, "mesh node running, type ? for help");

    repl(&mesh).await?;

    mesh.stop().await;
    Ok(())
}

/// Interactive command loop on stdin. Line-oriented on purpose so it can
/// be driven from a pipe.
async fn repl(mesh: &Mesh) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));

        match cmd {
            "" => {}
            "?" | "help" => print_help(),
            "q" | "quit" => return Ok(()),
            "list" => {
                for status in mesh.peers() {
                    let state = if status.connected { "up" } else { "down" };
                    println!("  {} [{}]", status.peer, state);
                }
            }
            "failed" => {
                for peer in mesh.disconnected_peers() {
                    println!("  {peer}");
                }
            }
            "health" => println!("  healthy: {}", mesh.is_healthy()),
            "add" => match rest.parse::<PeerArg>() {
                Ok(p) => {
                    if !mesh.add_peer(Peer::new(p.host, p.port)) {
                        println!("  peer already known");
                    }
                }
                Err(e) => println!("  {e}"),
            },
            "del" => match rest.parse::<PeerArg>() {
                Ok(p) => {
                    if let Err(e) = mesh.remove_peer(&p.host, p.port).await {
                        println!("  {e}");
                    }
                }
                Err(e) => println!("  {e}"),
            },
            "send" => match rest.split_once(' ') {
                Some((peer, msg)) => match peer.parse::<PeerArg>() {
                    Ok(p) => {
                        if let Err(e) = mesh.send(&p.host, p.port, msg.as_bytes()).await {
                            println!("  {e}");
                        }
                    }
                    Err(e) => println!("  {e}"),
                },
                None => println!("  usage: send HOST:PORT MESSAGE"),
            },
            "sendsync" => match rest.split_once(' ') {
                Some((peer, msg)) => match peer.parse::<PeerArg>() {
                    Ok(p) => {
                        match mesh
                            .send_sync(&p.host, p.port, Duration::from_secs(5), msg.as_bytes())
                            .await
                        {
                            Ok(response) => {
                                println!("  response: {}", String::from_utf8_lossy(&response))
                            }
                            Err(e) => println!("  {e}"),
                        }
                    }
                    Err(e) => println!("  {e}"),
                },
                None => println!("  usage: sendsync HOST:PORT MESSAGE"),
            },
            "bcast" => {
                if let Err(e) = mesh.broadcast(rest.as_bytes()).await {
                    println!("  {e}");
                }
            }
            other => println!("  unknown command {other:?}, type ? for help"),
        }
    }
}

fn print_help() {
    println!(
        "  ?                        this help\n\
         \x20 list                     known peers and link state\n\
         \x20 failed                   peers without a live connection\n\
         \x20 health                   whole-mesh health\n\
         \x20 add HOST:PORT            add a peer\n\
         \x20 del HOST:PORT            remove a peer\n\
         \x20 send HOST:PORT MSG       fire-and-forget message\n\
         \x20 sendsync HOST:PORT MSG   request/response with 5s timeout\n\
         \x20 bcast MSG                message every connected peer\n\
         \x20 q                        quit"
    );
}
