mod cli;
mod config;
mod error;
mod exec;
mod mcp;
mod process;
mod sync;
#[cfg(test)]
mod testing;
mod util;
mod vm;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::exec::Executor;
use crate::process::LocalInvoker;
use crate::sync::SyncEngine;
use crate::vm::VmManager;

#[derive(Parser)]
#[command(
    name = "devsandbox",
    about = "Disposable Vagrant development VMs with an MCP control plane"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server (stdio transport).
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify host prerequisites (vagrant, rsync, ssh, base directory).
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// List persisted VMs and their states (no MCP client needed).
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the MCP transport; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config)?;
        }
        Commands::Status { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config).await?;
        }
        Commands::Serve { config: config_path } => {
            let config = cli::load_config(config_path)?;

            let invoker: Arc<dyn crate::process::Invoker> = Arc::new(LocalInvoker);
            let vms = Arc::new(VmManager::new(&config, Arc::clone(&invoker))?);
            let sync = Arc::new(SyncEngine::new(
                &config,
                Arc::clone(&vms),
                Arc::clone(&invoker),
            ));
            let executor = Arc::new(Executor::new(
                Arc::clone(&vms),
                Arc::clone(&sync),
                Arc::clone(&invoker),
            ));

            tracing::info!(base_dir = %config.vm.base_dir.display(), "devsandbox starting");

            // Serve until the client disconnects or we receive a signal.
            let serve_result = tokio::select! {
                result = mcp::serve(&config, vms, sync, executor) => result,
                _ = shutdown_signal() => {
                    tracing::info!("received shutdown signal");
                    Ok(())
                }
            };

            tracing::info!("devsandbox shut down");
            serve_result?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
