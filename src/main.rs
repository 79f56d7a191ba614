//! Tempo daemon: wire the components once at startup and run the workers.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tempo::api::NodeApi;
use tempo::block::genesis::{self, GenesisSettings};
use tempo::chain::{ChainStore, Packager};
use tempo::config::Config;
use tempo::keys;
use tempo::kv::KvStore;
use tempo::mempool::Mempool;
use tempo::merge::{MergeEngine, MergeHandleSlot};
use tempo::network::gossip::GossipBus;
use tempo::network::manager::Manager;
use tempo::network::server::PeerServer;
use tempo::network::session::SessionContext;
use tempo::node::RoundDriver;
use tempo::round::RoundTimer;
use tempo::selector::BlockSelector;
use tempo::utxo::UtxoSet;
use tempo::vdf::Calculator;
use tempo::vote::VoteCenter;

#[derive(Parser, Debug)]
#[command(name = "tempod")]
#[command(about = "Tempo proof-of-time ledger daemon", long_about = None)]
struct Args {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<String>,

    /// Create the genesis block when the store is empty.
    #[arg(long)]
    bootstrap: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config_path = args
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| tempo::config::default_data_dir().join("config.toml"));
    let mut config = match Config::load_or_create(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = Some(data_dir);
    }
    if args.bootstrap {
        config.node.bootstrap = true;
    }

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(config).await {
        error!(error = %e, "Fatal startup error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let key = keys::load_or_create(&data_dir.join("node.key"))?;
    let address = keys::address_from_pubkey(&key.verifying_key());
    let packager = Packager {
        address: address.clone(),
        pub_key: keys::pub_key_hex(&key),
        reward: config.consensus.coinbase_reward,
    };
    info!(%address, name = %config.node.name, "Starting node");

    let kv = Arc::new(KvStore::open(
        &data_dir.join("db"),
        config.storage.cache_mb,
    )?);
    let chain = Arc::new(ChainStore::new(kv.clone()));
    let utxo = Arc::new(UtxoSet::new(kv.clone()));
    utxo.reindex(&chain)?;

    let calculator = Arc::new(Calculator::new(config.consensus.eligibility_threshold));
    let mempool = Arc::new(Mempool::new(chain.clone(), config.consensus.mempool_size));
    let votes = Arc::new(VoteCenter::new(
        calculator.clone(),
        kv.clone(),
        address.clone(),
        config.node.id,
    ));
    let timer = Arc::new(RoundTimer::new(
        chain.clone(),
        config.consensus.round_interval_ms,
        config.consensus.finish_offset_ms,
    ));

    let merge_slot = MergeHandleSlot::new();
    let selector = Arc::new(BlockSelector::new(
        chain.clone(),
        merge_slot.clone(),
        config.consensus.round_interval_ms,
        config.consensus.package_offset_ms,
    ));
    let manager = Arc::new(Manager::new(
        chain.clone(),
        selector.clone(),
        merge_slot.clone(),
    ));
    let (engine, merge) = MergeEngine::new(
        chain.clone(),
        utxo.clone(),
        mempool.clone(),
        votes.clone(),
        timer.clone(),
        calculator.clone(),
        selector.clone(),
        merge_slot,
    );

    // Seed the round state from whatever is already committed.
    if let Some(height) = chain.latest_height()? {
        timer.refresh(height, false);
        selector.refresh(height);
        votes.refresh(height, false);
        mempool.set_height(height as i64, false);
    } else if config.node.bootstrap {
        let settings = GenesisSettings {
            modulus_bits: config.vdf.modulus_bits,
            time_param: config.vdf.time_param,
        };
        let block = genesis::build(&packager, &settings);
        info!(hash = %block.hash(), "Bootstrapping genesis block");
        merge.submit(block);
    } else {
        warn!("Empty store and bootstrap disabled; waiting for peers");
    }

    let gossip = Arc::new(GossipBus::new(
        listen_host(&config.network.listen_address),
        config.network.gossip_port,
        mempool.clone(),
        manager.clone(),
    ));

    let session_ctx = Arc::new(SessionContext {
        chain: chain.clone(),
        merge: merge.clone(),
        manager: manager.clone(),
        votes: votes.clone(),
        local_address: address.clone(),
        handshake_interval: Duration::from_secs(config.network.handshake_interval_secs),
    });
    let server = Arc::new(PeerServer::new(
        config.network.listen_address.clone(),
        config.network.bootstrap_peers.clone(),
        session_ctx,
    ));

    let driver = Arc::new(RoundDriver::new(
        chain.clone(),
        mempool.clone(),
        votes.clone(),
        timer.clone(),
        calculator.clone(),
        selector.clone(),
        manager.clone(),
        packager,
    ));

    // Kept alive for the front-end surface; exercised by integration tests.
    let _api = NodeApi::new(
        chain.clone(),
        utxo,
        mempool,
        votes.clone(),
        timer,
        gossip.clone(),
        manager.clone(),
    );

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();
    workers.push(tokio::spawn(engine.run(shutdown.clone())));
    workers.push(tokio::spawn(votes.run(shutdown.clone())));
    workers.push(tokio::spawn(
        calculator.run(chain.clone(), shutdown.clone()),
    ));
    workers.push(tokio::spawn(manager.run_broadcast(shutdown.clone())));
    workers.push(tokio::spawn(gossip.clone().run_server(shutdown.clone())));
    workers.push(tokio::spawn(gossip.run_client(shutdown.clone())));
    workers.push(tokio::spawn(server.clone().run_listener(shutdown.clone())));
    workers.push(tokio::spawn(server.run_connector(shutdown.clone())));
    workers.push(tokio::spawn(driver.run(shutdown.clone())));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(2), worker).await;
    }
    kv.flush()?;
    info!("Node stopped");
    Ok(())
}

fn listen_host(listen_address: &str) -> String {
    listen_address
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| "0.0.0.0".into())
}
