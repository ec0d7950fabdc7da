//! BAR node binary.
//!
//! Starts a node with the libp2p transport, the peer-admission controller and
//! its three coordinators, plus the diagnostics JSON-RPC server. Rounds are
//! derived from wall-clock time so nodes sharing a network agree on them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bar_core::constants::{
    DEFAULT_MAX_OUTGOING, DEFAULT_P2P_PORT, DEFAULT_POM_BAN_THRESHOLD, DEFAULT_POM_THRESHOLD, DEFAULT_RPC_PORT,
    DEFAULT_WHITELIST_CAPACITY,
};
use bar_core::types::unix_now;
use bar_network::NetworkConfig;
use bar_node_lib::config::{DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_ROUND_INTERVAL};
use bar_node_lib::{BarNode, NodeConfig, start_rpc_server};
use clap::Parser;
use tracing::{debug, info};

/// BAR node: peer admission, handshakes, inactivity detection and optimistic push.
#[derive(Parser, Debug)]
#[command(name = "bar-node", version, about = "BAR peer-admission node with JSON-RPC diagnostics")]
struct Args {
    /// Data directory for the node identity key
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long, default_value = "127.0.0.1")]
    rpc_bind: String,

    /// RPC server port
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    rpc_port: u16,

    /// P2P listen address
    #[arg(long, default_value = "0.0.0.0")]
    p2p_listen_addr: String,

    /// P2P listen port
    #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
    p2p_listen_port: u16,

    /// Seed node multiaddrs to dial at startup (comma-separated)
    #[arg(long, value_delimiter = ',')]
    seed_addresses: Vec<String>,

    /// Maximum whitelist size
    #[arg(long, default_value_t = DEFAULT_WHITELIST_CAPACITY)]
    whitelist_capacity: usize,

    /// Maximum outgoing bootstrap dials
    #[arg(long, default_value_t = DEFAULT_MAX_OUTGOING)]
    max_outgoing: usize,

    /// Misbehaviour score at which a whitelisted peer is demoted
    #[arg(long, default_value_t = DEFAULT_POM_THRESHOLD)]
    pom_threshold: u64,

    /// Misbehaviour score at which a greylisted peer is banned
    #[arg(long, default_value_t = DEFAULT_POM_BAN_THRESHOLD)]
    pom_ban_threshold: u64,

    /// Act as a seed node: probe peers and mark inactive ones
    #[arg(long)]
    seed_node: bool,

    /// Request headers only when pushing chain data
    #[arg(long)]
    light: bool,

    /// Round length in seconds
    #[arg(long, default_value_t = DEFAULT_ROUND_INTERVAL.as_secs())]
    round_secs: u64,

    /// Maintenance tick in milliseconds
    #[arg(long, default_value_t = DEFAULT_MAINTENANCE_INTERVAL.as_millis() as u64)]
    maintenance_ms: u64,

    /// Disable mDNS local discovery
    #[arg(long)]
    no_mdns: bool,

    /// Join the test network instead of mainnet
    #[arg(long)]
    testnet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Convert CLI args into a NodeConfig.
    fn into_config(self) -> (NodeConfig, String) {
        let base = if self.testnet {
            NetworkConfig::testnet()
        } else {
            NetworkConfig::mainnet()
        };

        let data_dir = self.data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bar")
                .join(&base.network_id)
        });

        let mut network = NetworkConfig {
            listen_addr: self.p2p_listen_addr,
            listen_port: self.p2p_listen_port,
            enable_mdns: !self.no_mdns && base.enable_mdns,
            node_key_path: Some(data_dir.join("node.key")),
            ..base
        };
        network.policy.seed_addresses = self.seed_addresses;
        network.policy.whitelist_capacity = self.whitelist_capacity;
        network.policy.max_outgoing = self.max_outgoing;
        network.policy.pom_threshold = self.pom_threshold;
        network.policy.pom_ban_threshold = self.pom_ban_threshold;
        network.inactivity.is_seed_node = self.seed_node;
        network.push.light_node = self.light;

        let config = NodeConfig {
            data_dir,
            rpc_bind: self.rpc_bind,
            rpc_port: self.rpc_port,
            network,
            log_level: self.log_level,
            round_interval: Duration::from_secs(self.round_secs),
            maintenance_interval: Duration::from_millis(self.maintenance_ms),
        };

        (config, self.log_format)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, log_format) = args.into_config();

    init_logging(&config.log_level, &log_format);

    info!("BAR node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {}", config.network.network_id);
    info!("data_dir: {:?}", config.data_dir);
    info!("rpc_addr: {}", config.rpc_addr());
    info!("p2p_listen: {}", config.network.listen_multiaddr());
    info!("seed_addresses: {:?}", config.network.policy.seed_addresses);
    info!("seed_node: {}", config.network.inactivity.is_seed_node);

    config.validate().context("invalid configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data_dir {:?}", config.data_dir))?;

    let node = BarNode::start(config.clone()).await.context("failed to start node")?;
    node.bootstrap().context("bootstrap failed")?;
    node.advance_round(config.round_at(unix_now()));

    let rpc_handle = start_rpc_server(&config.rpc_addr(), Arc::clone(&node))
        .await
        .context("failed to start RPC server")?;
    info!("RPC server listening on {}", config.rpc_addr());

    let rounds = tokio::spawn(drive_rounds(Arc::clone(&node)));
    let runner = Arc::clone(&node);
    let node_task = tokio::spawn(async move { runner.run().await });

    info!("BAR node running (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await.context("failed to install Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down...");

    node.shutdown();
    rounds.abort();
    node_task.await.context("node task panicked")?;

    rpc_handle.stop().ok();
    info!("RPC server stopped");
    info!("BAR node shutdown complete");
    Ok(())
}

/// Advance the round whenever the wall clock crosses a round boundary and
/// log the peers selected for it.
async fn drive_rounds(node: Arc<BarNode>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut current = node.controller().current_round();
    loop {
        ticker.tick().await;
        if node.is_shutting_down() {
            break;
        }
        let round = node.config().round_at(unix_now());
        if round <= current {
            continue;
        }
        current = round;
        node.advance_round(round);
        let selected = node.select_peers(round);
        debug!(round, selected = ?selected, "round advanced");
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text. `RUST_LOG` takes precedence over `level_str`.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
