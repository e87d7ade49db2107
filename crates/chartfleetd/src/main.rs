//! chartfleetd — the chartfleet daemon.
//!
//! Hosts the chart deployment controller over an embedded redb store and
//! offers a few subcommands to load and inspect that store.
//!
//! # Usage
//!
//! ```text
//! chartfleetd run --manifest fleet.toml
//! chartfleetd apply fleet.toml
//! chartfleetd status --namespace fleet
//! ```

mod config;
mod manifest;

use std::path::{Path, PathBuf};

use chartfleet_controller::Manager;
use chartfleet_controller::status::{RELEASES_READY, ROLLOUT_COMPLETED};
use chartfleet_state::conditions;
use chartfleet_state::{
    ChartDeployment, Cluster, ClusterRelease, ObjectKey, READY, Resource, ResourceStore, Selector,
    StateStore,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, LogFormat};
use crate::manifest::Manifest;

#[derive(Parser)]
#[command(name = "chartfleetd", about = "chartfleet daemon")]
struct Cli {
    /// Configuration file (defaults to ./chartfleetd.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state; overrides the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Manifests applied before the controller starts.
        #[arg(long)]
        manifest: Vec<PathBuf>,

        /// Number of reconcile workers; overrides the config file.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Create or update the objects in a manifest.
    Apply { path: PathBuf },
    /// Request deletion of an object.
    Delete {
        kind: Kind,
        /// Object key as `namespace/name`.
        key: String,
    },
    /// Print stored objects as JSON.
    Get {
        kind: Kind,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Print a one-line rollout summary per chart deployment.
    Status {
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Cluster,
    ChartDeployment,
    ClusterRelease,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.store.data_dir = data_dir;
    }
    init_tracing(&config)?;

    match cli.command {
        Command::Run { manifest, workers } => {
            if let Some(workers) = workers {
                config.controller.workers = workers;
            }
            run(&config, &manifest).await
        }
        Command::Apply { path } => {
            let store = open_store(&config)?;
            apply_manifest(&store, &path).await
        }
        Command::Delete { kind, key } => {
            let store = open_store(&config)?;
            let key = ObjectKey::parse(&key)
                .ok_or_else(|| anyhow::anyhow!("expected namespace/name, got {key:?}"))?;
            match kind {
                Kind::Cluster => store.delete::<Cluster>(&key).await?,
                Kind::ChartDeployment => store.delete::<ChartDeployment>(&key).await?,
                Kind::ClusterRelease => store.delete::<ClusterRelease>(&key).await?,
            }
            info!(%key, "deletion requested");
            Ok(())
        }
        Command::Get { kind, namespace } => {
            let store = open_store(&config)?;
            let ns = namespace.as_deref();
            match kind {
                Kind::Cluster => print_all::<Cluster>(&store, ns).await,
                Kind::ChartDeployment => print_all::<ChartDeployment>(&store, ns).await,
                Kind::ClusterRelease => print_all::<ClusterRelease>(&store, ns).await,
            }
        }
        Command::Status { namespace } => {
            let store = open_store(&config)?;
            print_status(&store, namespace.as_deref()).await
        }
    }
}

fn init_tracing(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log.filter)?,
    };
    match config.log.format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
    Ok(())
}

fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(config: &DaemonConfig, manifests: &[PathBuf]) -> anyhow::Result<()> {
    info!("chartfleet daemon starting");
    let store = open_store(config)?;

    for path in manifests {
        apply_manifest(&store, path).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for CTRL+C");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let controller = config.controller_config();
    info!(
        workers = controller.workers,
        requeue_after_secs = controller.requeue_after.as_secs(),
        "controller configured"
    );
    Manager::new(store, controller).run(shutdown_rx).await?;

    info!("chartfleet daemon stopped");
    Ok(())
}

async fn apply_manifest(store: &StateStore, path: &Path) -> anyhow::Result<()> {
    let manifest = Manifest::from_file(path)?;
    manifest.apply(store).await?;
    info!(objects = manifest.len(), path = ?path, "manifest applied");
    Ok(())
}

async fn print_all<R: Resource + Serialize>(store: &StateStore, namespace: Option<&str>) -> anyhow::Result<()> {
    let objects: Vec<R> = store.list(namespace, &Selector::everything()).await?;
    println!("{}", serde_json::to_string_pretty(&objects)?);
    Ok(())
}

async fn print_status(store: &StateStore, namespace: Option<&str>) -> anyhow::Result<()> {
    let deployments: Vec<ChartDeployment> = store.list(namespace, &Selector::everything()).await?;
    println!(
        "{:<32} {:<8} {:<16} {:<10} {}",
        "DEPLOYMENT", "READY", "RELEASES-READY", "ROLLED", "CLUSTERS"
    );
    for d in &deployments {
        let rolled = match d.status.rollout {
            Some(state) if state.generation == d.metadata.generation => state.count.to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:<32} {:<8} {:<16} {:<10} {}",
            d.metadata.key().to_string(),
            conditions::status(d, READY).to_string(),
            conditions::status(d, RELEASES_READY).to_string(),
            rolled,
            d.status.matching_clusters.len(),
        );
        if !conditions::is_true(d, ROLLOUT_COMPLETED) {
            if let Some(message) = conditions::get(d, ROLLOUT_COMPLETED).and_then(|c| c.message.as_deref()) {
                println!("  {message}");
            }
        }
    }
    Ok(())
}
