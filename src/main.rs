//! Flood Ledger CLI
//!
//! Run one node, a local cluster, or inspect a stopped node's store.

use clap::{Parser, Subcommand};
use flood_ledger::config::NodeConfig;
use flood_ledger::consensus::ConsensusKind;
use flood_ledger::core::Block;
use flood_ledger::ledger::{ChainView, Node, NodeHandle};
use flood_ledger::network::NodeId;
use flood_ledger::storage::ChainStore;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "flood-ledger")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer UTXO ledger with pluggable consensus", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single node
    Node {
        /// Node id; the node listens on port-base + id
        #[arg(long)]
        id: NodeId,

        #[arg(long, value_enum)]
        consensus: Option<ConsensusKind>,

        /// Root data directory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Seed phrase of the node key
        #[arg(long)]
        seed: Option<String>,

        #[arg(long)]
        port_base: Option<u16>,
    },

    /// Run nodes 0..N in this process
    Cluster {
        #[arg(short, long, default_value = "4")]
        nodes: u64,

        #[arg(long, value_enum)]
        consensus: Option<ConsensusKind>,

        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the genesis block
    Genesis,

    /// Print a balance from a stopped node's store
    Balance {
        /// The node's store directory, e.g. data/node-3
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Hex encoded public key
        #[arg(short, long)]
        public_key: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Commands::Genesis => {
            println!("{}", serde_json::to_string_pretty(&Block::genesis()?)?);
        }

        Commands::Balance {
            data_dir,
            public_key,
        } => {
            let balance = read_balance(&data_dir, &public_key)?;
            println!("{}", balance);
        }

        Commands::Node {
            id,
            consensus,
            data_dir,
            seed,
            port_base,
        } => {
            config.id = id;
            if let Some(consensus) = consensus {
                config.consensus = consensus;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if seed.is_some() {
                config.seed = seed;
            }
            if let Some(port_base) = port_base {
                config.base_port = port_base;
            }
            run_nodes(vec![config])?;
        }

        Commands::Cluster {
            nodes,
            consensus,
            data_dir,
        } => {
            config.node_count = nodes;
            config.fanout = config.fanout.min(nodes.saturating_sub(1) as usize);
            if let Some(consensus) = consensus {
                config.consensus = consensus;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            // Every node derives its own key from its id
            config.seed = None;
            let configs = (0..nodes)
                .map(|id| NodeConfig {
                    id,
                    ..config.clone()
                })
                .collect();
            run_nodes(configs)?;
        }
    }

    Ok(())
}

/// Run nodes until Ctrl+C or the first failure
fn run_nodes(configs: Vec<NodeConfig>) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut handles: Vec<NodeHandle> = Vec::new();
        let mut tasks = tokio::task::JoinSet::new();
        for config in configs {
            let node = Node::new(config)?;
            log::info!("Node key {}", node.ledger().public_key());
            handles.push(node.handle());
            tasks.spawn(node.run());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                for handle in &handles {
                    let _ = handle.shutdown().await;
                }
                while tasks.join_next().await.is_some() {}
            }
            Some(result) = tasks.join_next() => {
                result??;
                log::warn!("A node stopped");
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn read_balance(data_dir: &Path, public_key: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let store = ChainStore::open(data_dir)?;
    let Some(head) = store.last_block()? else {
        return Ok(0);
    };
    Ok(ChainView::new(&store, &head).balance_of(public_key)?)
}
