//! PAW node - runs the P2P core standalone.
//!
//! In normal mode the node handshakes inbound peers, dials seeds' candidates
//! and keeps its outbound floor. In seed mode the listener answers discovery
//! crawls from the node's candidate pool instead.

use anyhow::{Context, Result};
use clap::Parser;
use paw_p2p::{ConnectionManager, NetworkEvent, ScoreBook};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::NodeConfig;

/// PAW P2P node.
#[derive(Parser, Debug)]
#[command(name = "paw-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "paw-node.toml")]
    config: PathBuf,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Node identifier
    #[arg(long)]
    node_id: Option<String>,

    /// Chain identifier
    #[arg(long)]
    chain_id: Option<String>,

    /// Seed address (host:port), repeatable
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Persistent peer (id@host:port), repeatable
    #[arg(long = "persistent-peer")]
    persistent_peers: Vec<String>,

    /// Answer seed crawls instead of accepting peers
    #[arg(long)]
    seed_mode: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init_config {
        NodeConfig::default().save(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    init_logging(&args.log_level)?;

    info!("Starting PAW node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    let network_config = config.network_config()?;

    info!("Node: {}", config.node_id);
    info!("Chain: {}", config.chain_id);
    info!("P2P: {}", config.p2p.listen_address);
    if config.seed_mode {
        info!("Running as seed node");
    }

    let reputation = Arc::new(ScoreBook::new(config.ban_duration()));
    let (manager, mut events) =
        ConnectionManager::new(network_config, reputation).context("Failed to create connection manager")?;
    manager.start()?;

    let listener = TcpListener::bind(&config.p2p.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.p2p.listen_address))?;
    if config.seed_mode {
        manager.spawn_seed_responder(listener);
    } else {
        manager.spawn_listener(listener);
    }

    let event_loop = async {
        while let Some(event) = events.recv().await {
            log_event(event);
        }
    };

    tokio::select! {
        _ = event_loop => {
            warn!("Event channel closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let stats = manager.stats();
    info!(
        connections = stats.connections,
        dial_failures = stats.dial_failures,
        candidates = stats.known_candidates,
        "Final stats"
    );
    manager.shutdown().await;
    info!("PAW node stopped");

    Ok(())
}

/// `RUST_LOG` wins over `--log-level` when set.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {:?}", level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install subscriber: {}", e))
}

fn log_event(event: NetworkEvent) {
    match event {
        NetworkEvent::PeerConnected { peer_id, addr, direction } => {
            info!(peer = %peer_id, %addr, %direction, "Peer connected");
        }
        NetworkEvent::PeerDisconnected { peer_id, reason } => {
            info!(peer = %peer_id, ?reason, "Peer disconnected");
        }
        NetworkEvent::MessageReceived { peer_id, message } => {
            debug!(peer = %peer_id, msg_type = %message.msg_type, len = message.payload.len(), "Message received");
        }
        NetworkEvent::DialFailed { address, error, attempts } => {
            warn!(peer = %address, attempts, %error, "Dial failed");
        }
    }
}
