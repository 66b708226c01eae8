//! linekv - A Line-Oriented In-Memory Key-Value Server
//!
//! Parses the command line, sets up logging, and runs the server until
//! Ctrl+C.

use clap::Parser;
use linekv::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_SHUTDOWN_TIMEOUT};
use linekv::{Server, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use std::future::Future;
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A line-oriented in-memory key-value server
#[derive(Debug, Parser)]
#[command(name = "linekv", version, about)]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connections beyond this are answered with an error and closed
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Seconds active connections get to finish on shutdown
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_SHUTDOWN_TIMEOUT.as_secs())]
    shutdown_timeout: u64,

    /// Evict the least recently used key once this many are stored
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    max_keys: Option<u64>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            max_connections: args.max_connections,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            max_keys: args
                .max_keys
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
            ..Default::default()
        }
    }
}

/// Resolves when `signal` fires. If the handler could not be installed the
/// server keeps running, so this never resolves.
async fn shutdown_requested<F>(signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "Could not listen for Ctrl+C, running until the listener fails");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from(Args::parse());

    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!(version = linekv::VERSION, "Starting linekv");

    let server = Server::bind(config).await?;
    let mut handle = server.start();
    info!(addr = %handle.local_addr(), "Ready to accept connections");

    tokio::select! {
        result = handle.wait() => {
            // Only a fatal listener error gets here
            result?;
            return Ok(());
        }
        _ = shutdown_requested(signal::ctrl_c()) => {
            info!("Shutdown signal received, stopping server...");
        }
    }

    let uptime = handle.uptime();
    let stats = handle.stats();
    let store_stats = handle.store().stats();
    handle.shutdown().await?;
    info!(
        uptime_secs = uptime.as_secs(),
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        keys = store_stats.keys,
        evicted = store_stats.evicted,
        "Server shutdown complete"
    );
    Ok(())
}
