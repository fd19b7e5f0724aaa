//! SSH server listener
//!
//! Accepts incoming tunnel connections and spawns a handler for each.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::server::handler::{ClientHandler, ServerConfig};
use crate::state::BrokerState;

/// SSH server that listens for incoming tunnel connections
pub struct TunnelServer {
    /// Server configuration
    config: ServerConfig,
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl TunnelServer {
    /// Create a new tunnel server
    pub fn new(host_key: KeyPair, state: Arc<BrokerState>, cancel: CancellationToken) -> Self {
        Self {
            config: ServerConfig::new(host_key),
            state,
            cancel,
        }
    }

    /// Run the server accept loop
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Tunnel server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Tunnel server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn a handler for a new incoming connection.
    ///
    /// Each connection gets a child token so the lifecycle manager can
    /// disconnect one tunnel (stale handle replacement) without touching
    /// the rest of the fleet.
    fn handle_connection(&self, socket: tokio::net::TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config.ssh_config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let handler = ClientHandler::new(state, cancel.clone(), peer_addr);

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                    return;
                }
                result = russh::server::run_stream(config, socket, handler) => result
            };

            match result {
                Ok(_) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Load or generate the broker host key
pub async fn load_or_generate_host_key(path: &std::path::Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        Ok(key)
    } else {
        tracing::info!("Generating new host key at {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let key = KeyPair::generate_ed25519()
            .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

        // TODO: persist the generated key once russh_keys grows a writer;
        // until then the fingerprint agents pin changes on restart
        tracing::warn!("Host key persistence not yet implemented - key will change on restart");

        Ok(key)
    }
}
