//! gridctld daemon CLI
//!
//! Runs the controller against a declared topology, checks configuration
//! files, or dumps a state snapshot as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gridctld::controller::Topology;
use gridctld::rpc::TcpTransport;
use gridctld::state::snapshot;
use gridctld::{Controller, ControllerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridctld")]
#[command(about = "Central controller for the grid cluster resource manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Controller configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Run {
        /// Cluster topology file (nodes and partitions)
        #[arg(short, long)]
        topology: PathBuf,
        /// Restore job/node state from the save location before serving
        #[arg(long)]
        restore: bool,
    },

    /// Parse and validate the configuration, then exit
    CheckConfig,

    /// Print a saved state snapshot as JSON
    DumpState {
        /// Directory holding job_state / node_state
        #[arg(short, long)]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ControllerConfig::load(cli.config.as_deref())
        .context("loading controller configuration")?;

    match cli.command {
        Commands::Run { topology, restore } => {
            let topology =
                Topology::load_from_file(&topology).context("loading cluster topology")?;
            let transport = Arc::new(TcpTransport::new(Duration::from_secs(
                config.command_timeout,
            )));
            let controller = Controller::new(config, transport);
            controller
                .bootstrap(topology)
                .await
                .context("loading topology into tables")?;
            if restore {
                let (jobs, nodes) = controller
                    .restore_state()
                    .await
                    .context("restoring saved state")?;
                tracing::info!(jobs, nodes, "restored saved state");
            }
            controller.start();
            tracing::info!("gridctld up");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            controller
                .save_state()
                .await
                .context("writing state snapshots")?;
            controller.shutdown().await;
        }

        Commands::CheckConfig => {
            config.validate().context("validating configuration")?;
            println!("configuration ok");
        }

        Commands::DumpState { state_dir } => {
            let job_buf = std::fs::read(state_dir.join("job_state"))
                .context("reading job_state")?;
            let jobs = snapshot::restore_jobs(&job_buf).context("decoding job_state")?;
            let node_buf = std::fs::read(state_dir.join("node_state"))
                .context("reading node_state")?;
            let nodes = snapshot::restore_nodes(&node_buf).context("decoding node_state")?;
            let dump = serde_json::json!({
                "jobs": jobs,
                "nodes": nodes,
            });
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
    }
    Ok(())
}
