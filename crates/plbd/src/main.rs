//! plbd: the PLB daemon.
//!
//! Loads a configuration file and a cluster seed, then either runs the
//! refresh loop until interrupted or computes a single plan.
//!
//! # Usage
//!
//! ```text
//! plbd run --config plb.toml --cluster cluster.json --data-dir /var/lib/plb
//! plbd plan --cluster cluster.json
//! ```

mod authority;
mod cluster;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use plb_core::{DroppedMovement, FailoverUnitMovement, PlbConfig};
use plb_metrics::StatsStore;
use plb_scheduler::{PlacementAndLoadBalancer, RecordingAuthority};

use crate::authority::LoggingAuthority;
use crate::cluster::ClusterSeed;

#[derive(Parser)]
#[command(name = "plbd", about = "Placement and load-balancing daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the refresh loop until Ctrl-C.
    Run {
        /// PLB configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cluster seed (JSON).
        #[arg(long)]
        cluster: PathBuf,

        /// Directory for the statistics history.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run one refresh against the seed and print the plan as JSON.
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        cluster: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,plbd=debug,plb=debug"));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run {
            config,
            cluster,
            data_dir,
        } => run(config.as_deref(), &cluster, data_dir.as_deref()).await,
        Command::Plan { config, cluster } => plan(config.as_deref(), &cluster),
    }
}

/// `PlbConfig::from_file` validates what it loads.
fn load_config(path: Option<&Path>) -> anyhow::Result<PlbConfig> {
    match path {
        Some(path) => PlbConfig::from_file(path),
        None => Ok(PlbConfig::default()),
    }
}

async fn run(config: Option<&Path>, cluster: &Path, data_dir: Option<&Path>) -> anyhow::Result<()> {
    info!("PLB daemon starting");

    let config = load_config(config)?;
    let authority = Arc::new(LoggingAuthority::new());
    let mut engine = PlacementAndLoadBalancer::new(config, authority.clone());

    // ── Statistics history ─────────────────────────────────────

    if let Some(data_dir) = data_dir {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let db_path = data_dir.join("plb-stats.redb");
        let store = StatsStore::open(&db_path)?;
        info!(path = ?db_path, "statistics store opened");
        engine = engine.with_statistics_store(store);
    }

    ClusterSeed::from_file(cluster)?.apply(&engine)?;
    let engine = Arc::new(engine);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_engine = engine.clone();
    let refresh_handle = tokio::spawn(async move {
        loop_engine.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    refresh_handle.await?;

    info!(
        movements = authority.emitted(),
        "PLB daemon stopped"
    );
    print!("{}", engine.render_metrics());
    Ok(())
}

#[derive(Serialize)]
struct Plan {
    decision_id: String,
    actions: Vec<(String, String)>,
    movements: Vec<FailoverUnitMovement>,
    dropped: Vec<DroppedMovement>,
}

fn plan(config: Option<&Path>, cluster: &Path) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let engine = PlacementAndLoadBalancer::new(config, Arc::new(RecordingAuthority::new()));
    ClusterSeed::from_file(cluster)?.apply(&engine)?;

    let report = engine.refresh(Instant::now());
    let plan = Plan {
        decision_id: report.decision_id.to_string(),
        actions: report
            .actions
            .iter()
            .map(|(domain, action)| (domain.to_string(), action.to_string()))
            .collect(),
        movements: report.emitted.into_values().collect(),
        dropped: report.dropped,
    };
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
