//! setup-cluster: first-time cluster credentials setup.
//!
//! Expects `config.toml` to already exist (copied from `config.toml.template`).
//! Reads the cluster password interactively (hidden input), checks that the
//! cluster answers with it, and stores it in the config file.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use nft_bid_tracker::cluster::ClusterManager;
use nft_bid_tracker::config::{AppConfig, CONFIG_PATH};

#[derive(Parser)]
#[command(
    name = "setup-cluster",
    about = "Verify cluster credentials and save them to config.toml"
)]
struct Cli {
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// ACL user name, if the cluster uses one
    #[arg(long)]
    username: Option<String>,

    /// Skip the password prompt (cluster without AUTH)
    #[arg(long)]
    no_password: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_path();

    let mut app_config = AppConfig::load(config_path).with_context(|| {
        format!(
            "{} not found - copy config.toml.template to config.toml first",
            config_path.display()
        )
    })?;
    app_config.cluster.validate().context("invalid [cluster] section")?;

    println!("=== NFT Bid Tracker - Cluster Setup ===\n");

    // Step 1: credentials
    let password = if cli.no_password {
        None
    } else {
        let password = rpassword::prompt_password("Enter cluster password: ")
            .context("failed to read password")?;
        if password.trim().is_empty() {
            bail!("password cannot be empty (use --no-password for clusters without AUTH)");
        }
        Some(password.trim().to_string())
    };
    app_config.cluster.username = cli.username.or(app_config.cluster.username);
    app_config.cluster.password = password;

    // Step 2: connect and ping every node
    println!("Connecting to {}...", app_config.cluster.nodes.join(", "));
    let manager = ClusterManager::new(app_config.cluster.clone());
    let handle = manager
        .get_client()
        .await
        .context("cluster rejected the connection - check nodes and credentials")?;
    let nodes = handle.topology().nodes();
    for node in &nodes {
        let rtt = handle
            .ping_node(node)
            .await
            .with_context(|| format!("PING {node} failed"))?;
        println!("  {node}: {:.1} ms", rtt.as_secs_f64() * 1000.0);
    }
    println!();

    // Step 3: save
    println!("Updating {}...", config_path.display());
    app_config.save(config_path)?;
    println!("  Config updated successfully");
    println!();

    println!("=== Setup Complete ===");
    println!("  Nodes:     {}", nodes.len());
    println!("  Slot ranges: {}", handle.topology().ranges.len());
    println!();
    println!("Next steps:");
    println!("  cargo run --bin bid-progress -- show <task-id>");

    Ok(())
}
