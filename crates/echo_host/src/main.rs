//! Tether Echo Host
//!
//! Standalone reference server for exercising Tether clients.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tether_echo::EchoServer;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tether Echo Host - heartbeat endpoint plus a JSON echo WebSocket
#[derive(Parser, Debug)]
#[command(name = "tether-echo")]
#[command(author = "Tether Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reference echo server for Tether clients", long_about = None)]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level)?;

    info!("Starting Tether Echo Host v{}", env!("CARGO_PKG_VERSION"));

    let bind_addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", args.bind))?;

    let server = EchoServer::new();
    let addr = server.start(bind_addr).await.context("Failed to start echo server")?;
    println!("Echo host ready: http://{}", addr);

    // Wait for shutdown signal
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to setup SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Setup logging with tracing
fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
