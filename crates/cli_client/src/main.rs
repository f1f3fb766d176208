//! Command-line client for a Tether server
//! Prints transport events and sends each stdin line as a JSON payload

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::{CoreError, HeartbeatConfig, TlsCredentials, Transport, TransportOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tether CLI - talk to a Tether server from the terminal
#[derive(Parser, Debug)]
#[command(name = "tether-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interactive client for a Tether server", long_about = None)]
struct Args {
    /// Server URI (http, https, ws or wss)
    uri: String,

    /// CA certificate (PEM) trusted instead of the web PKI roots
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate (PEM), requires --client-key
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 5000)]
    heartbeat_ms: u64,

    /// How long to wait for replies after stdin ends, in milliseconds
    #[arg(long, default_value_t = 2000)]
    linger_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Test reachability once and exit
    #[arg(long, default_value_t = false)]
    probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let credentials = TlsCredentials::from_files(
        args.ca_cert.as_deref(),
        args.client_cert.as_deref(),
        args.client_key.as_deref(),
    )
    .context("Failed to read TLS files")?;
    let options = TransportOptions::default()
        .with_credentials(credentials)
        .with_heartbeat(
            HeartbeatConfig::default().with_interval(Duration::from_millis(args.heartbeat_ms)),
        );
    let transport = Transport::connect(&args.uri, options)
        .with_context(|| format!("Failed to set up transport for {}", args.uri))?;

    if args.probe {
        let result = transport.probe().await;
        transport.close().await;
        return match result {
            Ok(()) => {
                println!("{} is reachable", args.uri);
                Ok(())
            }
            Err(CoreError::Heartbeat(err)) => {
                println!("{}", serde_json::to_string(&err)?);
                bail!("{} is not reachable: {}", args.uri, err.code)
            }
            Err(e) => Err(e.into()),
        };
    }

    let _subscriptions = vec![
        transport.on_connect(|| eprintln!("* connected")),
        transport.on_reconnect(|| eprintln!("* reconnected")),
        transport.on_disconnect(|| eprintln!("* disconnected")),
        transport.on_message(|payload| println!("{}", payload)),
        transport.on_heartbeat_error(|err| eprintln!("* heartbeat error: {}", err)),
    ];

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim() == "/exit" => break,
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => transport.send(parse_line(&line)),
                None => {
                    linger(|| transport.queued(), Duration::from_millis(args.linger_ms)).await;
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, closing");
                break;
            }
        }
    }

    transport.close().await;
    Ok(())
}

/// JSON lines are sent as-is; anything else as a JSON string
fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

/// Give queued messages and their replies a chance to arrive
///
/// Returns once `budget` has passed; `queued` reports what is still unsent.
async fn linger(queued: impl Fn() -> usize, budget: Duration) {
    let deadline = Instant::now() + budget;
    let drained = tokio::time::timeout_at(deadline, async {
        while queued() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        eprintln!("* {} messages still queued", queued());
        return;
    }
    // Replies to the last messages may still be on the way
    tokio::time::sleep_until(deadline).await;
}

/// Setup logging with tracing
fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::WARN);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
