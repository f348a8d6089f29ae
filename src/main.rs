//! Mini-Node CLI Application
//!
//! Runs the peer connection manager of a node.

use clap::{Args, Parser, Subcommand};
use mini_node::network::node::limited_except;
use mini_node::network::{NetConfig, Network, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How often the running node prints its status
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "mini-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer connection manager for a mini proof-of-stake node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run(RunArgs),

    /// Print the default configuration as JSON
    DefaultConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on and default port for peers
    #[arg(short, long)]
    port: Option<u16>,

    /// Node to keep connected (repeatable)
    #[arg(long = "addnode")]
    add_nodes: Vec<String>,

    /// Connect only to these nodes (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Connect once to fetch addresses, then disconnect (repeatable)
    #[arg(long = "seednode")]
    seed_nodes: Vec<String>,

    /// Maximum number of connections
    #[arg(long = "maxconnections")]
    max_connections: Option<usize>,

    /// SOCKS5 proxy for outbound connections
    #[arg(long)]
    proxy: Option<SocketAddr>,

    /// Only connect to nodes in this network (repeatable)
    #[arg(long = "onlynet")]
    only_net: Vec<Network>,

    /// Do not accept inbound connections
    #[arg(long = "nolisten")]
    no_listen: bool,

    /// Map the listening port with UPnP
    #[arg(long)]
    upnp: bool,

    /// Where to keep known peer addresses
    #[arg(long = "peers-file")]
    peers_file: Option<PathBuf>,
}

impl RunArgs {
    /// Load the config file, then apply command line overrides
    fn into_config(self) -> Result<(NetConfig, Vec<String>), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => NetConfig::load(path)?,
            None => NetConfig::default(),
        };

        if let Some(port) = self.port {
            config.default_port = port;
            config.listen = vec![SocketAddr::from(([0, 0, 0, 0], port))];
        }
        config.add_nodes.extend(self.add_nodes);
        config.connect_only.extend(self.connect);
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if self.proxy.is_some() {
            config.proxy = self.proxy;
        }
        if !self.only_net.is_empty() {
            config.limited_networks = limited_except(&self.only_net);
        }
        if self.no_listen {
            config.listen_enabled = false;
        }
        if self.upnp {
            config.upnp = true;
        }
        if self.peers_file.is_some() {
            config.peers_file = self.peers_file;
        }

        config.validate()?;
        Ok((config, self.seed_nodes))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&NetConfig::default())?);
            Ok(())
        }
        Commands::Run(args) => {
            let (config, seed_nodes) = args.into_config()?;
            run_node(config, seed_nodes)
        }
    }
}

fn run_node(config: NetConfig, seed_nodes: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        println!("🌐 Starting node...");
        let node = Node::start(config).await?;
        for seed in seed_nodes {
            node.add_one_shot(seed).await;
        }

        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = node.status().await;
                    println!(
                        "📊 {} peers ({} in / {} out), {} known addresses, {} banned",
                        status.peers,
                        status.inbound,
                        status.outbound,
                        status.known_addresses,
                        status.banned
                    );
                }
                _ = &mut ctrl_c => {
                    println!("\n📴 Shutting down node...");
                    break;
                }
            }
        }

        node.shutdown().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
