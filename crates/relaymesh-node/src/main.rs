//! RelayMesh node daemon
//!
//! Runs a mesh node over UDP until interrupted with Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use relaymesh_network::UdpTransport;
use relaymesh_node::config::LoggingConfig;
use relaymesh_node::{Config, Node, SqliteStore};
use relaymesh_routing::{load_identity, MeshEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relaymesh-node")]
#[command(about = "Store-and-forward mesh messaging node")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "RELAYMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database, cache)
    #[arg(short, long, env = "RELAYMESH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Log filter, overrides the configured level
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(logging: &LoggingConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::PeerDiscovered(peer) => info!("Peer discovered: {} ({})", peer.id, peer.role),
        MeshEvent::MessageReceived { chat_id, message } => {
            info!("[{}] {}: {}", chat_id, message.sender, message.content)
        }
        MeshEvent::RouteDiscovered { destination, path } => {
            info!("Route to {} ({} hops)", destination, path.len() + 1)
        }
        MeshEvent::NetworkStatusChanged(status) => info!(
            "Network: {}/{} peers online, health {}%",
            status.connected_count, status.node_count, status.health_percent
        ),
        MeshEvent::IdentityRegenerated { node_id } => {
            warn!("Running with a regenerated identity {}", node_id)
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config, args.data_dir)?;
        println!("Configuration written to {}", config.config_path().display());
        println!("Data directory: {}", config.data_directory.display());
        return Ok(());
    }

    let config = Config::load(args.config, args.data_dir)?;
    init_logging(&config.logging, args.log_level.as_deref());

    relaymesh_crypto::init().context("Failed to initialize libsodium")?;

    std::fs::create_dir_all(&config.data_directory).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.data_directory.display()
        )
    })?;
    let store = SqliteStore::open(&config.database_path())
        .await
        .context("Failed to open database")?;

    let loaded = load_identity(&store, config.node.identity_recovery)
        .await
        .context("Failed to load node identity")?;
    let local_id = loaded.identity.node_id;

    let transport = Arc::new(
        UdpTransport::bind(local_id, config.udp_config()?)
            .await
            .context("Failed to bind UDP transport")?,
    );

    let node = Node::start(
        loaded,
        config.router_config(),
        transport.clone(),
        Arc::new(store),
    )
    .await?;

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    transport.connect_all().await;

    info!("═══════════════════════════════════════════════");
    info!("  RelayMesh node is now running");
    info!("═══════════════════════════════════════════════");
    info!("  Node ID: {}", local_id.to_hex());
    info!("  Name: {}", config.node.name);
    info!("  UDP: {}", transport.local_addr()?);
    info!("  Data Dir: {}", config.data_directory.display());
    info!("═══════════════════════════════════════════════");

    signal::ctrl_c().await?;
    info!("Received Ctrl+C signal");

    node.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}
