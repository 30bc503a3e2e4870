use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fvp_chain::{GatewayClient, HttpPriceOracle, MultiplierTuple};
use fvp_engine::{LoggingLpBootstrap, Orchestrator, SystemClock};
use fvp_store::PgStore;
use serde::Deserialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::Config;

/// FVP Distribution Engine - fractionalization vault settlement daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the periodic distribution driver
    Run,
    /// Print a vault's distribution status
    Status {
        #[arg(long)]
        vault: String,
    },
    /// Put a vault in manual mode, bypassing automated progression
    EnableManualMode {
        #[arg(long)]
        vault: String,
    },
    /// Submit an exact multiplier batch for a manual-mode vault
    SubmitBatch {
        #[arg(long)]
        vault: String,
        /// JSON file with `multipliers` and `coin_distribution` arrays
        #[arg(long)]
        file: String,
        /// Overwrite the on-chain arrays instead of appending
        #[arg(long)]
        replace_existing: bool,
    },
    /// Re-drive settlement for specific claims
    ProcessClaims {
        #[arg(long)]
        vault: String,
        #[arg(long, num_args = 1..)]
        claims: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ManualBatchFile {
    multipliers: Vec<MultiplierTuple>,
    #[serde(default)]
    coin_distribution: Vec<MultiplierTuple>,
}

fn init_tracing(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fvp={log_level},fvp_engine={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn build_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let store = Arc::new(PgStore::connect(&config.database).await?);
    let client = Arc::new(GatewayClient::new(config.gateway.clone())?);
    let oracle = Arc::new(HttpPriceOracle::new(config.oracle.clone())?);
    Ok(Arc::new(Orchestrator::new(
        client,
        oracle,
        store,
        Arc::new(SystemClock),
        Arc::new(LoggingLpBootstrap),
        config.engine.clone(),
    )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config = Config::load_or_default(&args.config)?;
    info!("📋 Configuration loaded from {}", args.config);

    let orchestrator = build_orchestrator(&config).await?;

    match args.command {
        Command::Run => {
            info!("🚀 Starting FVP distribution daemon");
            let driver = orchestrator.clone();
            let handle = tokio::spawn(driver.run());
            shutdown_signal().await;
            handle.abort();
            info!("👋 FVP distribution daemon shutdown complete");
        }
        Command::Status { vault } => {
            let report = orchestrator.status(&vault).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::EnableManualMode { vault } => {
            orchestrator.enable_manual_mode(&vault).await?;
            println!("vault {vault} is now in manual mode");
        }
        Command::SubmitBatch {
            vault,
            file,
            replace_existing,
        } => {
            let batch: ManualBatchFile = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            orchestrator
                .submit_batch_manual(
                    &vault,
                    batch.multipliers,
                    batch.coin_distribution,
                    replace_existing,
                )
                .await?;
            println!("manual batch submitted for vault {vault}");
        }
        Command::ProcessClaims { vault, claims } => {
            orchestrator.process_claims(&vault, &claims).await?;
            println!("processed {} claims for vault {vault}", claims.len());
        }
    }
    Ok(())
}
