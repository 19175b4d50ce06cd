//! feewatch: fee-rate recommendation and chain-tip polling daemon.
//!
//! Polls an upstream chain API for the fee summary and the latest block
//! height, derives one recommended fee rate, and serves both over a local
//! JSON-RPC Unix socket. Upstream failures degrade to the last known good
//! value; they never take the daemon down.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod cache;
mod chain_tip;
mod config;
mod gateway;
mod orchestrator;
mod poller;
mod server;
mod store;

use chain_tip::{ChainTip, HeightSettings};
use config::{Config, LogFormat, StoreConfig};
use orchestrator::{FeeOrchestrator, FeeSettings};
use poller::{PollState, Poller};
use store::{KeyValueStore, MemoryStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the Unix socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    init_tracing(config.log_format);

    info!("⛓  feewatch v{}", env!("CARGO_PKG_VERSION"));
    info!(
        upstream = ?config.upstream.kind,
        policy = ?config.fee.policy,
        fallback_rate = config.fee.fallback_rate,
        "Configuration loaded"
    );

    // ── Keyed State Store ───────────────────────────────────────────
    let store: Arc<dyn KeyValueStore> = match &config.store {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::Sqlite { db_path } => Arc::new(
            SqliteStore::open(db_path).context("Failed to open state store")?,
        ),
    };
    store
        .ensure(store::POOL_COINS_KEY, serde_json::json!([]))
        .context("Failed to initialize state store")?;

    // ── Upstream Gateway ────────────────────────────────────────────
    let gateway = gateway::from_config(&config.upstream)?;
    info!(provider = gateway.provider_id(), "Upstream gateway ready");

    // ── Orchestrator + Chain Tip ────────────────────────────────────
    let orchestrator = Arc::new(FeeOrchestrator::new(
        Arc::clone(&gateway),
        FeeSettings::from_config(&config),
    ));
    let chain_tip = Arc::new(ChainTip::new(
        Arc::clone(&gateway),
        HeightSettings::from_config(&config),
    ));

    // ── Pollers ─────────────────────────────────────────────────────
    let fee_poller = Poller::new(Arc::clone(&orchestrator), config.fee_interval());
    let height_poller = Poller::new(Arc::clone(&chain_tip), config.height_interval());
    fee_poller.activate();
    height_poller.activate();
    tokio::spawn(watch_staleness(fee_poller.subscribe(), config.stale_after_cycles));
    tokio::spawn(watch_staleness(height_poller.subscribe(), config.stale_after_cycles));

    // ── JSON-RPC Server ─────────────────────────────────────────────
    let services = Arc::new(server::Services {
        orchestrator,
        chain_tip,
        fee_poller: fee_poller.clone(),
        height_poller: height_poller.clone(),
        store,
    });
    let srv = server::Server::new(config.socket_path.clone(), services);

    info!("feewatch ready");
    tokio::select! {
        res = srv.run() => {
            if let Err(e) = &res {
                error!("Server stopped: {:#}", e);
            }
            fee_poller.deactivate();
            height_poller.deactivate();
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping pollers");
            fee_poller.deactivate();
            height_poller.deactivate();
            let _ = std::fs::remove_file(&config.socket_path);
            Ok(())
        }
    }
}

/// Log once when a polled value goes stale and once when it recovers.
async fn watch_staleness<T>(mut rx: watch::Receiver<PollState<T>>, max_missed: u32) {
    let mut was_stale = false;
    while rx.changed().await.is_ok() {
        let (target, stale, missed, last_error) = {
            let state = rx.borrow();
            (state.target, state.is_stale(max_missed), state.missed_cycles, state.last_error.clone())
        };
        if stale && !was_stale {
            warn!(
                pollable = target,
                missed_cycles = missed,
                last_error = last_error.as_deref().unwrap_or_default(),
                "Serving stale data"
            );
        } else if !stale && was_stale {
            info!(pollable = target, "Data fresh again");
        }
        was_stale = stale;
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "feewatch=info".into());

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}
