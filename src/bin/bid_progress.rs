use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use nft_bid_tracker::cluster::ClusterManager;
use nft_bid_tracker::config::{AppConfig, CONFIG_PATH, ENV_API_TOKEN};
use nft_bid_tracker::reporter;
use nft_bid_tracker::service::ProgressService;
use nft_bid_tracker::types::Marketplace;

#[derive(Parser)]
#[command(name = "bid-progress", about = "Inspect and manage live NFT bids of a task")]
struct Args {
    /// Path to the config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Dashboard API token (falls back to BID_TRACKER_API_TOKEN)
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print one progress report
    Show { task_id: String },
    /// Print a progress report every poll interval until Ctrl+C
    Watch {
        task_id: String,
        /// Override progress.poll_interval_secs
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Remove one order key from the registry
    Cancel {
        task_id: String,
        /// opensea, blur or magiceden
        marketplace: Marketplace,
        order_key: String,
    },
    /// Drop registry entries whose order record is gone
    Prune { task_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    config.apply_env_overrides();
    info!("Loaded config from {}", args.config.display());

    let manager = ClusterManager::new(config.cluster.clone());
    let service = ProgressService::from_config(&config, manager.clone())
        .context("invalid configuration")?;
    let token = args.token.or_else(|| std::env::var(ENV_API_TOKEN).ok());
    let credential = token.as_deref();

    match args.command {
        Command::Show { task_id } => {
            let report = service.get_progress(credential, &task_id).await?;
            reporter::report_progress(&report);
        }
        Command::Watch {
            task_id,
            interval_secs,
        } => {
            let poll_duration =
                Duration::from_secs(interval_secs.unwrap_or(config.progress.poll_interval_secs).max(1));
            info!(%task_id, poll_secs = poll_duration.as_secs(), "Watching task");

            // First report right away, then one per interval.
            let report = service.get_progress(credential, &task_id).await?;
            reporter::report_progress(&report);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = tokio::time::sleep(poll_duration) => {
                        match service.get_progress(credential, &task_id).await {
                            Ok(report) => {
                                if report.is_partial() {
                                    warn!(
                                        timed_out = ?report.timed_out,
                                        failed = ?report.failed,
                                        state = ?manager.state(),
                                        "Partial report"
                                    );
                                }
                                reporter::report_progress(&report);
                            }
                            Err(e) => warn!("Poll cycle error: {e}"),
                        }
                    }
                }
            }
        }
        Command::Cancel {
            task_id,
            marketplace,
            order_key,
        } => {
            let removed = service
                .cancel(credential, &task_id, marketplace, &order_key)
                .await?;
            reporter::report_summary(&serde_json::json!({
                "taskId": task_id,
                "marketplace": marketplace,
                "orderKey": order_key,
                "removed": removed,
            }));
        }
        Command::Prune { task_id } => {
            let removed = service.prune(credential, &task_id).await?;
            reporter::report_summary(&serde_json::json!({
                "taskId": task_id,
                "removed": removed,
            }));
        }
    }

    Ok(())
}
