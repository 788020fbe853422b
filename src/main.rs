use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use indiecoin_core::{Miner, Store, DIFFICULTY_BITS};
use shared::{Address, BlockchainError};

mod network;
mod node;
mod protocol;

use network::Peer;
use node::Node;

#[derive(Parser)]
#[command(name = "indiecoin")]
#[command(about = "IndieCoin - minimal peer-to-peer cryptocurrency node")]
#[command(version)]
struct Cli {
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// TCP port to listen on
    #[arg(long, default_value_t = 6666)]
    port: u16,

    /// Maximum connections to allow
    #[arg(long, default_value_t = 50)]
    max_peers: usize,

    /// Known peers to contact on bootstrap (host:port,host:port,...)
    #[arg(long)]
    initial_peers: Option<String>,

    /// Run the node as a miner node
    #[arg(long)]
    mine: bool,

    /// Data directory (default ~/.indiecoin/data)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> shared::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .init();

    info!("starting indiecoin node");

    // Falha de esquema ou de bind é fatal; o resto o nó tolera
    let store = Arc::new(Store::open(cli.data_dir.clone(), None)?);
    let peer = Peer::new(&cli.bind, cli.port, cli.max_peers);
    let node = Node::new(Arc::clone(&peer), Arc::clone(&store), DIFFICULTY_BITS);

    if let Some(initial_peers) = &cli.initial_peers {
        for entry in initial_peers.split(',').filter(|e| !e.is_empty()) {
            match entry.rsplit_once(':').map(|(host, port)| (host, port.parse::<u16>())) {
                Some((host, Ok(port))) => {
                    peer.add_peer(entry, host, port);
                }
                _ => info!(entry, "skipping malformed initial peer"),
            }
        }
    }

    let listener = peer.start()?;

    let miner = if cli.mine {
        let address = Address::generate();
        info!(public_key = %address.public_key(), "mining rewards will pay this address");

        let miner = Miner::new(address);
        node.set_miner(miner.clone());

        let worker = miner.clone();
        let node_for_miner = Arc::clone(&node);
        thread::spawn(move || worker.run(move |block| node_for_miner.accept_mined_block(block)));

        Some(miner)
    } else {
        None
    };

    node.bootstrap();

    if miner.is_some() {
        // Primeiro candidato; dali em diante o nó religa o minerador
        // sempre que a cadeia ou o mempool mudam
        node.restart_miner();
    }

    let node_for_signal = Arc::clone(&node);
    ctrlc::set_handler(move || {
        info!("shutting down");
        node_for_signal.shutdown();
    })
    .map_err(|e| BlockchainError::IoError(e.to_string()))?;

    listener
        .join()
        .map_err(|_| BlockchainError::IoError("peer listener panicked".to_string()))?;

    info!("node stopped");
    Ok(())
}
