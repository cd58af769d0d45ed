mod config;

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chain::{ChainStore, MemoryChain, DEVNET_CONFIG};
use clap::Parser;
use consensus::build_engine;
use containers::Block;
use libp2p::Multiaddr;
use metrics::server::run_metrics_server;
use metrics::Metrics;
use networking::les::{ChtIndexer, LesOdr, RetrieveManager, ServerPool};
use networking::sync::{Downloader, NodeMode, SyncError, SyncEvent, SyncMode};
use networking::transport::{LesNetwork, OutboundCommand};
use networking::{LesChannel, PeerSet, SyncChannel, SyncNetwork};
use tokio::sync::{broadcast, mpsc};
use tokio::task;
use tracing::{error, info, warn};

use crate::config::NodeConfig;

/// How often the node checks whether a peer is ahead of it.
const SYNC_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How often finished CHT sections are indexed.
const INDEX_INTERVAL: Duration = Duration::from_secs(30);

/// How often the server pool is asked for a server to dial.
const DIAL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
struct Args {
    /// YAML node configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run as a light client.
    #[arg(long)]
    light: bool,

    /// full, fast or light.
    #[arg(long)]
    sync_mode: Option<SyncMode>,

    /// Use the small devnet helper trie sections.
    #[arg(long)]
    devnet: bool,

    #[arg(long)]
    metrics: bool,

    #[arg(long)]
    metrics_port: Option<u16>,

    /// Light servers to seed the server pool with.
    #[arg(short, long)]
    servers: Vec<String>,
}

fn apply_args(config: &mut NodeConfig, args: &Args) {
    if args.light {
        config.node_mode = NodeMode::Light;
    }
    match args.sync_mode {
        Some(mode) => config.sync.mode = mode,
        None if config.node_mode == NodeMode::Light => config.sync.mode = SyncMode::LightLegacy,
        None => {}
    }
    if args.devnet {
        config.chain = DEVNET_CONFIG;
    }
    if args.metrics {
        config.metrics.enabled = true;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.metrics_port = port;
    }
    config.servers.extend(args.servers.iter().cloned());
}

/// Fails every outbound request until a wire transport takes over the
/// channel. Dropping the responder is what fails the request.
async fn drain_outbound<Req: Display, Resp>(
    mut outbound: mpsc::UnboundedReceiver<OutboundCommand<Req, Resp>>,
    protocol: &'static str,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            OutboundCommand::Request(request) => warn!(
                protocol,
                peer = %request.peer,
                id = request.id,
                request = %request.request,
                "No wire transport attached, failing request"
            ),
            OutboundCommand::Disconnect(peer) => info!(protocol, %peer, "Disconnect requested"),
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Started { origin, target }) => info!(origin, target, "Sync started"),
            Ok(SyncEvent::Done { imported, head }) => info!(imported, %head, "Sync done"),
            Ok(SyncEvent::Failed { error }) => warn!(%error, "Sync failed"),
            Ok(SyncEvent::Cancelled) => info!("Sync cancelled"),
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "Missed sync events"),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Start a session whenever the best peer is ahead of the local chain.
/// Only storage failures end the loop.
async fn sync_loop<N: SyncNetwork>(downloader: Arc<Downloader<N>>, mode: SyncMode) -> Result<(), SyncError> {
    let mut interval = tokio::time::interval(SYNC_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let Some(peer) = downloader.peers().best_peer() else {
            continue;
        };
        if downloader.state().is_active() || peer.head.number <= downloader.progress().current_block {
            continue;
        }
        match downloader.synchronize(peer.id, peer.head.hash, mode).await {
            Ok(report) => info!(imported = report.imported, target = report.target, "Caught up with peer"),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!(peer = %peer.id, %err, "Sync session ended early"),
        }
    }
}

/// Hand the configured checkpoint roots to the ODR backend and return the
/// first CHT section the local indexer still has to build.
fn trust_checkpoint<N: LesNetwork>(odr: &LesOdr<N>, config: &NodeConfig) -> u64 {
    let mut first_section = 0;
    for trusted in &config.trusted_cht_roots {
        odr.add_cht_root(trusted.section, trusted.root);
        first_section = first_section.max(trusted.section + 1);
    }
    for trusted in &config.trusted_bloom_roots {
        odr.add_bloom_trie_root(trusted.section, trusted.root);
    }
    if let Some(last) = config.trusted_bloom_roots.iter().map(|trusted| trusted.section).max() {
        let covered = (last + 1) * config.chain.bloom_trie_frequency;
        info!(sections = config.trusted_bloom_roots.len(), covered, "Trusted bloom trie roots");
    }
    first_section
}

/// Light client services: on-demand retrieval, CHT indexing and server
/// dialing.
fn start_light(
    config: &NodeConfig,
    store: Arc<dyn ChainStore>,
    peers: Arc<PeerSet>,
    metrics: Arc<Metrics>,
) -> Result<Arc<LesOdr<LesChannel>>> {
    let pool = Arc::new(ServerPool::new(&store.genesis().hash(), &config.les));
    let servers = config
        .servers
        .iter()
        .map(|addr| addr.parse::<Multiaddr>().map_err(|err| anyhow!("invalid server address {addr}: {err}")))
        .collect::<Result<Vec<_>>>()?;
    let added = pool.add_candidates(servers);
    info!(added, topic = pool.topic().unwrap_or("none"), "Seeded server pool");

    let (network, outbound) = LesChannel::new();
    task::spawn(drain_outbound(outbound, "les"));

    let retriever = RetrieveManager::new(config.les.clone(), Arc::new(network), peers)
        .with_server_pool(pool.clone())
        .with_metrics(metrics);
    let odr = Arc::new(LesOdr::new(retriever, store.clone(), config.chain.clone()));

    let first_section = trust_checkpoint(&odr, config);
    let mut indexer = ChtIndexer::new(config.chain.clone(), store).starting_at(first_section);
    let index_odr = odr.clone();
    task::spawn(async move {
        let mut interval = tokio::time::interval(INDEX_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(err) = index_odr.apply_indexer(&mut indexer) {
                warn!(%err, "CHT indexing failed");
            }
        }
    });

    // Dialing belongs to the wire transport. Until one is attached every
    // suggestion counts as a failed dial so the backoff stays observable.
    task::spawn(async move {
        let mut interval = tokio::time::interval(DIAL_INTERVAL);
        loop {
            interval.tick().await;
            if let Some(addr) = pool.suggest() {
                info!(%addr, "Dialing light server");
                pool.record_dial_failure(&addr);
            }
        }
    });

    Ok(odr)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::default(),
    };
    apply_args(&mut config, &args);
    info!(node_mode = ?config.node_mode, sync_mode = %config.sync.mode, "Starting node");

    let metrics = Arc::new(Metrics::new()?);
    if config.metrics.enabled {
        let server_config = config.metrics.clone();
        let server_metrics = metrics.clone();
        task::spawn(async move {
            if let Err(err) = run_metrics_server(server_config, server_metrics).await {
                error!(%err, "Metrics server exited");
            }
        });
    }

    let store: Arc<dyn ChainStore> = Arc::new(MemoryChain::new(Block::default()));
    let engine = build_engine(&config.engine);
    let peers = Arc::new(PeerSet::new());

    let (network, outbound) = SyncChannel::new();
    task::spawn(drain_outbound(outbound, "sync"));
    let downloader = Arc::new(
        Downloader::new(
            config.sync.clone(),
            config.node_mode,
            store.clone(),
            engine,
            Arc::new(network),
            peers.clone(),
        )?
        .with_metrics(metrics.clone()),
    );
    task::spawn(log_events(downloader.subscribe()));

    let _odr = match config.node_mode {
        NodeMode::Light => Some(start_light(&config, store.clone(), peers, metrics)?),
        NodeMode::Full => None,
    };

    let mut sync = task::spawn(sync_loop(downloader.clone(), config.sync.mode));
    tokio::select! {
        result = &mut sync => {
            downloader.cancel();
            return match result {
                Ok(Err(err)) => Err(anyhow!("sync stopped: {err}")),
                Ok(Ok(())) => Ok(()),
                Err(err) => Err(anyhow!("sync task panicked: {err}")),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
    }

    downloader.cancel();
    sync.abort();
    Ok(())
}
