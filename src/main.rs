//! Edge Compute CLI entry point.
//!
//! This is the main entry point for running the edge compute HTTP server.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_compute_common::ConfigFile;
use edge_compute_server::EdgeServer;

/// Streaming edge compute server.
#[derive(Debug, Parser)]
#[command(name = "edge-compute", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "EDGE_COMPUTE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind address from the configuration file.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_compute=debug".into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Edge Compute");

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config file '{}'", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(bind_addr) = cli.bind_addr {
        file.server.bind_addr = bind_addr;
    }

    info!(
        bind_addr = %file.server.bind_addr,
        backends = file.backends.len(),
        services = file.services.len(),
        admin = file.admin.is_configured(),
        "Configuration loaded"
    );

    let server = EdgeServer::from_config_file(&file).context("Failed to initialize server")?;

    info!("Server initialized. Available endpoints:");
    info!("  GET  /health              - Health check");
    info!("  GET  /ready               - Readiness check");
    info!("  GET  /services            - List services");
    info!("  ANY  /services/:id/*path  - Run an exchange against a service");

    server.run().await?;

    Ok(())
}
