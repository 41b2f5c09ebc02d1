//! tetherd — the Tether daemon.
//!
//! Single binary that assembles the broker:
//! - State store (redb)
//! - Broker (catalog, provisioning, binding)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! tetherd serve --config /etc/tether/tether.toml --port 8080
//! tetherd seed --data-dir /var/lib/tether --file directory.json
//! tetherd init-config > tether.toml
//! ```

mod seed;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_broker::Broker;
use tether_core::TetherConfig;
use tether_state::StateStore;
use tracing::{error, info, warn};

/// How long background tasks get to finish after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tetherd", about = "Tether service broker daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker and its REST API.
    Serve {
        /// Path to tether.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Load users, teams, and apps from a JSON snapshot.
    Seed {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// JSON file with `users`, `teams`, and `apps` arrays.
        #[arg(long)]
        file: PathBuf,
    },
    /// Print a config file with every default spelled out.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tetherd=debug,tether=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let config = load_config(config.as_deref())?;
            run_serve(&config, port, data_dir).await
        }
        Command::Seed {
            config,
            data_dir,
            file,
        } => {
            let config = load_config(config.as_deref())?;
            run_seed(&config, data_dir, &file)
        }
        Command::InitConfig => {
            print!("{}", TetherConfig::scaffold().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TetherConfig> {
    match path {
        Some(path) => TetherConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(TetherConfig::default()),
    }
}

fn open_store(config: &TetherConfig, data_dir: Option<PathBuf>) -> anyhow::Result<StateStore> {
    let data_dir = data_dir.unwrap_or_else(|| config.data_dir());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let db_path = data_dir.join("tether.redb");

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run_serve(
    config: &TetherConfig,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Tether daemon starting");

    let settings = config.broker_settings()?;
    let store = open_store(config, data_dir)?;
    let broker = Arc::new(Broker::new(store, settings));

    let router = tether_api::build_router(broker.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or_else(|| config.port())));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    let aborted = broker.shutdown(SHUTDOWN_GRACE).await;
    if aborted > 0 {
        warn!(aborted, "background tasks aborted at shutdown");
    }

    info!("Tether daemon stopped");
    Ok(())
}

fn run_seed(config: &TetherConfig, data_dir: Option<PathBuf>, file: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let directory = seed::Directory::from_json(&json)?;
    let store = open_store(config, data_dir)?;
    directory.apply(&store)
}
