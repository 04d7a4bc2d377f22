//! Dialr Gateway - branch resolution HTTP server
//!
//! Loads experiment state from the store, keeps it in sync on a timer, and
//! serves `GET /branch` from memory with a durable assignment ledger.

use anyhow::Result;
use clap::Parser;
use dialr_common::Config;
use dialr_engine::Engine;
use dialr_store::{MemoryStore, RedbStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dialr-gateway")]
#[command(about = "Dialr branch resolution gateway")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/dialr/dialr.toml")]
    config: PathBuf,

    /// Listen address for the branch API (overrides config)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Path of the redb database file (overrides config)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Keep all state in memory instead of a database file
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// State sync interval in milliseconds (overrides config)
    #[arg(long)]
    sync_interval_ms: Option<u64>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

/// Load the config file, falling back to defaults when it is missing or
/// unparseable. Returns a warning to log once tracing is up.
fn load_config(path: &Path) -> (Config, Option<String>) {
    if !path.exists() {
        return (Config::default(), None);
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => (config, None),
            Err(e) => (
                Config::default(),
                Some(format!("Failed to parse config file {}: {}", path.display(), e)),
            ),
        },
        Err(e) => (
            Config::default(),
            Some(format!("Failed to read config file {}: {}", path.display(), e)),
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, config_warning) = load_config(&args.config);

    // CLI takes precedence over the config file
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(path) = args.store_path {
        config.store.path = path;
    }
    if let Some(interval_ms) = args.sync_interval_ms {
        config.sync.interval_ms = interval_ms;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(warning) = config_warning {
        warn!("{}, using defaults", warning);
    }

    if config.sync.interval_ms == 0 || config.maintenance.interval_ms == 0 {
        warn!(
            "Zero job interval configured, using {}ms",
            dialr_common::config::MIN_INTERVAL_MS
        );
    }

    info!("Starting Dialr Gateway");
    info!(
        "Sync every {}ms, maintenance every {}ms (grace {}s)",
        config.sync.interval_ms, config.maintenance.interval_ms, config.maintenance.grace_secs
    );

    let engine = if args.in_memory {
        info!("Using in-memory store");
        Engine::new(Arc::new(MemoryStore::new()), &config)
    } else {
        info!("Opening store at {}", config.store.path.display());
        Engine::new(Arc::new(RedbStore::open(&config.store.path)?), &config)
    };
    let engine = Arc::new(engine);

    // Initial load happens before the listener binds
    engine.start().await;

    let app = dialr_gateway::router(Arc::clone(&engine));
    let addr = config.server.listen;
    info!("Starting branch API on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    engine.shutdown();
    info!("Gateway shut down gracefully");

    Ok(())
}
