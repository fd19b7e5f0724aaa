//! Tether Broker Daemon
//!
//! The broker runs on a reachable host and accepts incoming reverse SSH
//! tunnels from remote agents. Operator tools drive it over the localhost
//! control surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, BrokerConfig};
use tether_broker::connection::HealthMonitor;
use tether_broker::control::ControlServer;
use tether_broker::dispatch::Dispatcher;
use tether_broker::directory::Directory;
use tether_broker::server::{load_or_generate_host_key, TunnelServer};
use tether_broker::state::BrokerState;

#[derive(Parser)]
#[command(name = "tether-broker")]
#[command(about = "Tether fleet broker daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tether broker starting...");

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                BrokerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            BrokerConfig::default()
        }
    };

    // Override bind address if specified
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    // Load or generate host key
    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    if let Ok(public_key) = host_key.clone_public_key() {
        tracing::info!("Host key fingerprint: {}", public_key.fingerprint());
    }

    // Load the persisted machine directory
    let directory = Directory::load(&config.state_dir)
        .with_context(|| format!("Failed to load machine directory from {:?}", config.state_dir))?;
    tracing::info!("Loaded {} machine records", directory.len());

    // Wire up broker state and the dispatcher
    let state = Arc::new(BrokerState::new(config.clone(), directory));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&state)));

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    // Heartbeat monitor
    let monitor = HealthMonitor::new(
        Arc::clone(&state.pool),
        Arc::clone(&state.manager),
        config.heartbeat_interval,
        config.heartbeat_timeout,
    );
    tokio::spawn(monitor.run(cancel.clone()));

    // Control server for operator tools
    let control = ControlServer::new(config.control_address(), dispatcher, cancel.clone());
    tokio::spawn(async move {
        if let Err(e) = control.run().await {
            tracing::error!("Control server failed: {}", e);
        }
    });

    // Tunnel server runs on the main task until cancelled
    let server = TunnelServer::new(host_key, Arc::clone(&state), cancel.clone());

    tracing::info!("Starting tunnel server on {}", bind_addr);
    server.run(&bind_addr).await?;

    tracing::info!("Broker shutdown complete");
    Ok(())
}
