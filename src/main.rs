//! ClipMesh - multi-node clipboard synchronization
//!
//! This is the main entry point for the ClipMesh node and its client commands.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipmesh::cli::{Cli, CliHandler};
use clipmesh::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_config(cli.config.clone());

    // Initialize logging
    let log_level = match (&config, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.log_level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipmesh={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "ClipMesh v{} ({}, built {})",
        clipmesh::VERSION,
        clipmesh::BUILD_TARGET,
        clipmesh::BUILD_DATE
    );

    let handler = CliHandler::from_loaded(config, cli.config, &cli.command)?;
    handler.handle_command(cli.command).await?;

    Ok(())
}
