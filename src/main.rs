// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dispatchd")]
#[command(author, version, about = "Distributed job-execution daemons", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job-executing worker daemon
    Worker {
        /// Path to the worker configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run the rendezvous master daemon
    Master {
        /// Path to the master configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Worker { config } => {
            let config = dispatchd::WorkerConfig::load(&config)
                .context("loading worker configuration")?;
            dispatchd::worker::run(config).await.context("worker daemon failed")?;
        }
        Commands::Master { config } => {
            let config = dispatchd::MasterConfig::load(&config)
                .context("loading master configuration")?;
            dispatchd::master::run(config).await.context("master daemon failed")?;
        }
    }
    Ok(())
}
