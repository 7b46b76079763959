use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storepool::cli;
use storepool::config;
use storepool::store::connector_for;
use storepool::{PoolManager, Purpose};

#[derive(Parser)]
#[command(name = "storepool")]
#[command(version, about = "Pooled, fault-tolerant connections to a key-value/queue store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to STOREPOOL_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and print the effective configuration
    CheckConfig,

    /// Drive concurrent traffic through one purpose's pool
    Simulate {
        /// Purpose to exercise (queue, session, cache, metrics)
        #[arg(long, default_value = "cache")]
        purpose: Purpose,

        /// Total number of commands
        #[arg(long, default_value = "10000")]
        operations: u64,

        /// Number of concurrent workers
        #[arg(long, default_value = "32")]
        concurrency: usize,
    },

    /// Print a metrics snapshot as JSON
    Metrics {
        /// Restrict to one purpose
        #[arg(long)]
        purpose: Option<Purpose>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration
    let config = config::load_config(cli.config.as_deref())?;

    if let Commands::CheckConfig = cli.command {
        return cli::cmd_check_config(&config);
    }

    let connector = connector_for(&config.store.url).context("Failed to set up store connector")?;
    let manager = Arc::new(PoolManager::new(config, connector));
    manager
        .initialize()
        .await
        .context("Failed to initialize connection pools")?;

    let result = match cli.command {
        Commands::CheckConfig => Ok(()),
        Commands::Simulate {
            purpose,
            operations,
            concurrency,
        } => cli::cmd_simulate(Arc::clone(&manager), purpose, operations, concurrency)
            .await
            .and_then(|_| cli::cmd_metrics(&manager, Some(purpose))),
        Commands::Metrics { purpose } => cli::cmd_metrics(&manager, purpose),
    };

    manager.shutdown().await;
    result
}
