mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use huddle_core::{
    bootstrap::{init_services, load_config},
    logging,
};

use server::HuddleServer;

/// SFU signaling server for multi-party audio/video rooms
#[derive(Debug, Parser)]
#[command(name = "huddle", version, about)]
struct Cli {
    /// Path to a YAML/TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Huddle server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Start the media engine and SFU
    let services = init_services(&config)?;

    // 4. Serve until shutdown
    HuddleServer::new(config, services).start().await
}
