//! Control server implementation
//!
//! Listens on localhost TCP for requests from operator tools. Uses TCP on
//! 127.0.0.1 for cross-platform compatibility (works on Unix, macOS,
//! Windows), one JSON message per line.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tether_core::control::{ControlRequest, ControlResponse};
use tether_core::DispatchError;

use crate::dispatch::Dispatcher;

/// Control server for operator tools
///
/// Listens on localhost (127.0.0.1) only - not accessible from network.
pub struct ControlServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    /// Shared dispatcher
    dispatcher: Arc<Dispatcher>,
    /// Cancellation token for shutdown
    shutdown: CancellationToken,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(address: String, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Self {
        Self {
            address,
            dispatcher,
            shutdown,
        }
    }

    /// Run the control server until the shutdown token fires
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind control server to {}", self.address))?;

        tracing::info!("Control server listening on {}", self.address);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Control server shutting down");
                    return Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            // Only accept connections from localhost
                            if !peer_addr.ip().is_loopback() {
                                tracing::warn!(
                                    "Rejected non-localhost control connection from {}",
                                    peer_addr
                                );
                                continue;
                            }

                            let dispatcher = Arc::clone(&self.dispatcher);
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, dispatcher, shutdown).await {
                                    tracing::warn!("Control client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept control connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<ControlRequest>(trimmed) {
                    Ok(request) => handle_request(request, &dispatcher, &shutdown).await,
                    Err(e) => ControlResponse::Error {
                        code: "invalid_argument".to_string(),
                        message: format!("Invalid request: {}", e),
                    },
                };

                let mut response_json = serde_json::to_string(&response)?;
                response_json.push('\n');
                writer.write_all(response_json.as_bytes()).await?;
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

fn error_response(e: DispatchError) -> ControlResponse {
    ControlResponse::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

/// Map one control request onto the dispatcher
async fn handle_request(
    request: ControlRequest,
    dispatcher: &Dispatcher,
    shutdown: &CancellationToken,
) -> ControlResponse {
    match request {
        ControlRequest::Run {
            machine,
            command,
            working_dir,
            env,
            timeout_ms,
        } => match dispatcher
            .run(machine.as_deref(), command, working_dir, env, timeout_ms)
            .await
        {
            Ok(result) => ControlResponse::Command(result),
            Err(e) => error_response(e),
        },

        ControlRequest::ReadFile {
            machine,
            path,
            size_limit,
        } => match dispatcher
            .read_file(machine.as_deref(), path, size_limit)
            .await
        {
            Ok(content) => ControlResponse::FileData { content },
            Err(e) => error_response(e),
        },

        ControlRequest::WriteFile {
            machine,
            path,
            content,
        } => match dispatcher
            .write_file(machine.as_deref(), path, content)
            .await
        {
            Ok(()) => ControlResponse::Ok,
            Err(e) => error_response(e),
        },

        ControlRequest::TransferFile {
            machine,
            direction,
            local_path,
            remote_path,
        } => match dispatcher
            .transfer_file(machine.as_deref(), direction, local_path, remote_path)
            .await
        {
            Ok(bytes) => ControlResponse::Transferred { bytes },
            Err(e) => error_response(e),
        },

        ControlRequest::ListFiles { machine, path } => {
            match dispatcher.list_files(machine.as_deref(), path).await {
                Ok(entries) => ControlResponse::Files { entries },
                Err(e) => error_response(e),
            }
        }

        ControlRequest::Metrics { machine, summary } => {
            match dispatcher.metrics(machine.as_deref(), summary).await {
                Ok(report) => ControlResponse::Metrics(report),
                Err(e) => error_response(e),
            }
        }

        ControlRequest::Describe { machine } => match dispatcher.describe(machine.as_deref()) {
            Ok(record) => ControlResponse::Machine(Box::new(record)),
            Err(e) => error_response(e),
        },

        ControlRequest::Find { query } => ControlResponse::Machines {
            machines: dispatcher.find(&query),
        },

        ControlRequest::Update { machine, update } => {
            match dispatcher.update(machine.as_deref(), &update) {
                Ok(record) => ControlResponse::Machine(Box::new(record)),
                Err(e) => error_response(e),
            }
        }

        ControlRequest::Configure {
            machine,
            webhook_url,
            rate_limit_rpm,
            rate_limit_concurrent,
        } => match dispatcher.configure(
            machine.as_deref(),
            webhook_url.as_deref(),
            rate_limit_rpm,
            rate_limit_concurrent,
        ) {
            Ok(record) => ControlResponse::Machine(Box::new(record)),
            Err(e) => error_response(e),
        },

        ControlRequest::Select { machine } => match dispatcher.select(&machine) {
            Ok(()) => ControlResponse::Ok,
            Err(e) => error_response(e),
        },

        ControlRequest::AcceptKey { machine } => match dispatcher.accept_key(machine.as_deref()) {
            Ok(()) => ControlResponse::Ok,
            Err(e) => error_response(e),
        },

        ControlRequest::RateStats { machine } => match dispatcher.rate_stats(machine.as_deref()) {
            Ok(stats) => ControlResponse::RateStats(stats),
            Err(e) => error_response(e),
        },

        ControlRequest::Status => ControlResponse::Status(dispatcher.status()),

        ControlRequest::Ping => ControlResponse::Pong,

        ControlRequest::Shutdown => {
            tracing::info!("Shutdown requested via control surface");
            shutdown.cancel();
            ControlResponse::Ok
        }
    }
}
