//! speakd - persistent PCM playback daemon
//!
//! Accepts raw PCM from TTS producers over WebSocket and plays it through a
//! native player process, one session per client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use speakd_daemon::{DaemonConfig, DaemonServer};

#[derive(Parser, Debug)]
#[command(name = "speakd", version, about = "Persistent PCM audio playback daemon")]
struct Args {
    /// Config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("🔊 Starting speakd v{}", env!("CARGO_PKG_VERSION"));
    info!("📋 Configuration loaded from {}", config.config_path.display());
    let players: Vec<String> = config.player.streaming.iter().map(|p| p.label()).collect();
    info!("  - Players: {}", players.join(" → "));
    if let Some(fallback) = &config.player.file_fallback {
        info!("  - File fallback: {}", fallback.program);
    }

    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    let server = DaemonServer::new(config);
    info!("🚀 speakd ready");

    server
        .serve(listener, async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("🛑 Received shutdown signal"),
                Err(e) => {
                    error!("Cannot listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await
                }
            }
        })
        .await?;

    info!("👋 speakd stopped");
    Ok(())
}
