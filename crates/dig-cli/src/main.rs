//! `dig` — operational CLI for a dig-node: a content-addressed store
//! distribution node on the dig overlay network.

mod config;
mod fabric;
mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand_core::OsRng;

use config::Config;
use dig_core::{Node, NodeConfig};
use dig_identity::Identity;
use fabric::TcpFabric;
use progress::format_bytes;

/// dig - content-addressed store distribution over the dig overlay network.
#[derive(Parser)]
#[command(name = "dig")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: serve local stores and participate in sync/relay/discovery.
    Run,

    /// Show this node's identity and configuration.
    Status,

    /// List peers this node currently knows about and their classification.
    Peers,

    /// Download a single store by id, using the orchestrator's strategy ladder.
    Download {
        /// Store id to fetch.
        store_id: String,
    },

    /// Generate a new Ed25519 identity keypair.
    Keygen {
        /// Write the private key (hex) to this file instead of stdout.
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    if let Commands::Keygen { output } = cli.command {
        return generate_keypair(output);
    }

    let config = load_config(cli.config.as_deref())?;
    let node_config = config.to_node_config();

    match cli.command {
        Commands::Run => run(node_config).await,
        Commands::Status => show_status(&node_config).await,
        Commands::Peers => list_peers(node_config).await,
        Commands::Download { store_id } => download_store(node_config, &store_id).await,
        Commands::Keygen { .. } => unreachable!("handled above"),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load(p),
        None => Config::load_or_default(),
    }
}

fn build_fabric(node: &Node) -> Arc<TcpFabric> {
    let listen_addr = format!("0.0.0.0:{}", node.config().listen_port);
    Arc::new(TcpFabric::new(node.local_peer_id().clone(), vec![listen_addr]))
}

/// Bring the node fully up: serve incoming `dig/1` connections, resume any
/// interrupted downloads, announce local stores, and run the background
/// sync/capability/relay loops until interrupted.
async fn run(node_config: NodeConfig) -> anyhow::Result<()> {
    let listen_port = node_config.listen_port;
    let node = Arc::new(Node::new(node_config)?);
    let fabric = build_fabric(&node);

    for peer in &node.config().bootstrap_peers.clone() {
        fabric.register_peer(peer.clone());
    }

    let accept_handle = tokio::spawn(fabric::serve(node.clone(), fabric.clone(), listen_port));

    node.start(fabric.clone()).await?;
    tracing::info!(
        peer_id = %node.local_peer_id(),
        overlay_address = %node.identity().overlay_address(),
        port = listen_port,
        "dig node running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    node.shutdown().await;
    accept_handle.abort();

    Ok(())
}

async fn show_status(node_config: &NodeConfig) -> anyhow::Result<()> {
    let node = Node::new(node_config.clone())?;

    println!("dig node status");
    println!("  peer id:         {}", node.local_peer_id());
    println!("  overlay address: {}", node.identity().overlay_address());
    println!("  network id:      {}", node_config.network_id);
    println!("  store dir:       {}", node_config.store_dir.display());
    println!("  listen port:     {}", node_config.listen_port);
    println!(
        "  chunk size:      {}",
        format_bytes(node_config.transfer.chunk_size)
    );
    println!(
        "  max concurrent:  {}",
        node_config.transfer.max_concurrent_chunks
    );
    println!("  bootstrap peers: {}", node_config.bootstrap_peers.len());
    println!("  discovery servers: {}", node_config.discovery_servers.len());

    Ok(())
}

async fn list_peers(node_config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::new(node_config)?;
    // A freshly constructed node has an empty registry; `dig peers` against
    // a running node would need to query it over an admin channel, which is
    // outside this crate's wire protocol. This reports what a cold-started
    // node sees before any `HANDSHAKE`/`DIG_NETWORK_IDENTIFICATION` traffic.
    println!("peers known to {}: none yet (run `dig run` to populate the registry)", node.local_peer_id());
    Ok(())
}

async fn download_store(node_config: NodeConfig, store_id: &str) -> anyhow::Result<()> {
    let node = Arc::new(Node::new(node_config)?);
    let fabric = build_fabric(&node);
    for peer in &node.config().bootstrap_peers.clone() {
        fabric.register_peer(peer.clone());
    }

    println!("downloading store {store_id}...");
    let outcome = node.download_store(fabric, store_id).await;

    if outcome.success {
        println!(
            "succeeded via {}",
            outcome
                .strategy
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "unknown strategy".to_string())
        );
        Ok(())
    } else {
        let reason = outcome
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no strategy succeeded".to_string());
        anyhow::bail!("download failed: {reason}");
    }
}

fn generate_keypair(output: Option<String>) -> anyhow::Result<()> {
    let identity = Identity::generate(&mut OsRng);

    println!("public key:      {}", hex::encode(identity.public_key()));
    println!("overlay address: {}", identity.overlay_address());

    match output {
        Some(path) => {
            let path = PathBuf::from(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Store the hex-encoded seed, matching the `privateKey` field
            // NodeConfig/Config expect.
            std::fs::write(&path, hex::encode(identity.to_seed_bytes()))?;
            println!("private key written to: {}", path.display());
        }
        None => {
            println!("private key:     {}", hex::encode(identity.to_seed_bytes()));
            println!("(not saved; pass --output to write it to a file)");
        }
    }

    Ok(())
}
