//! Media gateway
//!
//! An HTTP front end for an external media extraction tool (yt-dlp),
//! built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──▶ recover ─▶ access log ─▶ request id ─▶ cors ─▶ rate limit ─▶ auth
//!                                                                            │
//!              ┌─────────────────────────────────────────────────────────────┘
//!              ▼
//!          handlers ──▶ timeout ──▶ gate (N slots) ──▶ process runner ──▶ yt-dlp
//!              ▲                                              │ stdout
//!              └──────────────── streaming bridge ◀───────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use media_gateway::config::load_config;
use media_gateway::http::HttpServer;
use media_gateway::lifecycle::{wait_for_signal, Shutdown};
use media_gateway::observability::{logging, metrics};
use media_gateway::worker::MediaTool;

#[derive(Parser)]
#[command(name = "media-gateway")]
#[command(about = "HTTP gateway for yt-dlp", long_about = None)]
struct Args {
    /// Optional TOML config file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("media-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let capacity = config.workers.capacity();
    tracing::info!(
        bind_address = %config.listener.bind_address(),
        workers = capacity,
        request_timeout_secs = config.workers.request_timeout_secs,
        mode = ?config.cors.mode,
        "Configuration loaded"
    );

    // A missing tool binary is fatal here, never a per-request error.
    let tool = MediaTool::new(&config.workers.binary_path, capacity)?;

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let listener = TcpListener::bind(config.listener.bind_address()).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, tool);
    let server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    wait_for_signal().await;
    shutdown.trigger();

    server_task.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
