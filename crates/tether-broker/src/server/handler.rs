//! SSH client handler implementation
//!
//! Implements the russh server handler for accepting reverse tunnel
//! connections from remote agents. Every presented key is accepted at the
//! transport layer; identity and trust are decided at registration time,
//! where a key mismatch quarantines the machine instead of rejecting it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use tether_core::MachineId;
use tether_protocol::{Frame, FrameCodec, Message, RequestId};

use crate::connection::AgentCommand;
use crate::state::BrokerState;

/// Handler for a single SSH client connection
pub struct ClientHandler {
    /// Shared broker state
    state: Arc<BrokerState>,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Key fingerprint presented during auth
    fingerprint: Option<String>,
    /// Machine id (set after registration)
    machine_id: Option<MachineId>,
    /// Codec for decoding frames
    codec: FrameCodec,
    /// Buffer for incoming data
    buffer: BytesMut,
    /// Active SSH channels
    channels: HashSet<ChannelId>,
    /// Session handle for sending data (captured when channel opens)
    session_handle: Option<Handle>,
    /// Receiver side of the command channel, consumed by the processor task
    command_rx: Option<mpsc::Receiver<AgentCommand>>,
    /// Sender side of the command channel
    command_tx: mpsc::Sender<AgentCommand>,
    /// Handle to the command processor task
    command_processor_handle: Option<tokio::task::JoinHandle<()>>,
    /// Cancellation token for this connection (to allow external disconnect)
    cancel: CancellationToken,
}

impl ClientHandler {
    /// Create a new client handler with an external cancellation token
    pub fn new(state: Arc<BrokerState>, cancel: CancellationToken, peer_addr: SocketAddr) -> Self {
        // Command channel for this connection
        let (command_tx, command_rx) = mpsc::channel(256);

        Self {
            state,
            peer_addr,
            fingerprint: None,
            machine_id: None,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(8192),
            channels: HashSet::new(),
            session_handle: None,
            command_rx: Some(command_rx),
            command_tx,
            command_processor_handle: None,
            cancel,
        }
    }

    /// Process a decoded frame
    async fn handle_frame(&mut self, frame: Frame) {
        match frame.message {
            Message::Register {
                machine_id: reported_id,
                hostname,
                platform,
                capabilities,
                version,
            } => {
                self.handle_register(reported_id, hostname, platform, capabilities, version)
                    .await;
            }

            Message::Response { .. } | Message::Error { .. } => {
                self.route_to_tunnel(frame.request_id, frame.message).await;
            }

            Message::FileChunk(_) | Message::FileDone { .. } => {
                self.route_to_tunnel(frame.request_id, frame.message).await;
            }

            Message::HeartbeatAck { timestamp } => {
                let latency = tether_core::time::elapsed_millis(timestamp);
                if let Some(machine_id) = &self.machine_id {
                    tracing::trace!("Heartbeat ack from {}, latency={}ms", machine_id, latency);
                    if let Some(handle) = self.state.pool.get(machine_id) {
                        handle.record_heartbeat();
                    }
                }
            }

            other => {
                tracing::warn!(
                    "Unexpected message type {:?} from {}",
                    other.message_type(),
                    self.peer_addr
                );
            }
        }
    }

    /// Handle the agent's registration frame
    async fn handle_register(
        &mut self,
        reported_id: Option<String>,
        hostname: String,
        platform: String,
        capabilities: Vec<String>,
        version: Option<String>,
    ) {
        if self.machine_id.is_some() {
            tracing::warn!("Duplicate registration from {}", self.peer_addr);
            return;
        }

        let Some(fingerprint) = self.fingerprint.clone() else {
            tracing::error!("Registration from {} before authentication", self.peer_addr);
            return;
        };

        tracing::info!(
            "Registration from {}: {} ({}) protocol {}",
            self.peer_addr,
            hostname,
            platform,
            version.as_deref().unwrap_or("unknown")
        );

        // The processor must be running before the ack is queued
        self.start_command_processor();

        let outcome = match self.state.manager.register(
            reported_id,
            hostname,
            platform,
            capabilities,
            fingerprint,
            self.command_tx.clone(),
            self.cancel.clone(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Registration from {} failed: {}", self.peer_addr, e);
                let _ = self
                    .command_tx
                    .send(AgentCommand::RegisterAck {
                        accepted: false,
                        machine_id: String::new(),
                        quarantined: false,
                        reason: Some(e.to_string()),
                    })
                    .await;
                return;
            }
        };

        self.machine_id = Some(outcome.machine_id.clone());

        let _ = self
            .command_tx
            .send(AgentCommand::RegisterAck {
                accepted: true,
                machine_id: outcome.machine_id.to_string(),
                quarantined: outcome.quarantined,
                reason: None,
            })
            .await;
    }

    /// Route a response or stream frame to the tunnel's correlation state
    async fn route_to_tunnel(&self, request_id: RequestId, message: Message) {
        let Some(machine_id) = &self.machine_id else {
            tracing::warn!("Frame from {} before registration", self.peer_addr);
            return;
        };

        if let Some(handle) = self.state.pool.get(machine_id) {
            handle.complete(request_id, message).await;
        }
    }

    /// Start a background task that drains the command channel onto the wire
    fn start_command_processor(&mut self) {
        let Some(mut command_rx) = self.command_rx.take() else {
            tracing::warn!("Command processor already started");
            return;
        };

        let Some(handle) = self.session_handle.clone() else {
            tracing::error!("No session handle available for command processor");
            return;
        };

        let Some(&channel_id) = self.channels.iter().next() else {
            tracing::error!("No channel available for command processor");
            return;
        };

        let peer_addr = self.peer_addr;

        let task_handle = tokio::spawn(async move {
            tracing::debug!("Command processor started for {}", peer_addr);

            while let Some(command) = command_rx.recv().await {
                let frame = command.to_frame();
                let mut buf = BytesMut::new();
                let mut codec = FrameCodec::new();

                if let Err(e) = codec.encode(frame, &mut buf) {
                    tracing::error!("Failed to encode command: {}", e);
                    continue;
                }

                if let Err(e) = handle.data(channel_id, CryptoVec::from_slice(&buf)).await {
                    tracing::error!("Failed to send command to {}: {:?}", peer_addr, e);
                    break;
                }
            }

            tracing::debug!("Command processor stopped for {}", peer_addr);
        });

        self.command_processor_handle = Some(task_handle);
    }

    /// Tear down this connection's tunnel state.
    ///
    /// Guarded against reconnect races: a stale handler must not unregister
    /// the replacement tunnel, so only the handler whose command channel is
    /// still installed in the pool performs the unregister.
    fn connection_lost(&self) {
        let Some(machine_id) = &self.machine_id else {
            return;
        };
        if let Some(handle) = self.state.pool.get(machine_id) {
            if handle.command_tx.same_channel(&self.command_tx) {
                self.state.manager.unregister(machine_id);
            }
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.connection_lost();
        if let Some(handle) = self.command_processor_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Handle public key authentication.
    ///
    /// Every key is accepted here; what the fingerprint means for this
    /// machine is decided at registration, after the agent has identified
    /// itself. First contact records the key, a match confirms it, and a
    /// mismatch quarantines until an operator accepts the new key.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();

        tracing::info!(
            "Auth from {} ({}), key fingerprint: {}",
            self.peer_addr,
            user,
            fingerprint
        );

        self.fingerprint = Some(fingerprint);
        Ok(Auth::Accept)
    }

    /// Handle channel open request
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        tracing::debug!("Channel opened: {:?}", channel_id);

        self.channels.insert(channel_id);

        // Capture the session handle for later use
        if self.session_handle.is_none() {
            self.session_handle = Some(session.handle());
        }

        Ok(true)
    }

    /// Handle incoming data on a channel
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);

        self.buffer.extend_from_slice(data);

        // Drain complete frames from the buffer
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => {
                    self.handle_frame(frame).await;
                }
                Ok(None) => {
                    // Need more data
                    break;
                }
                Err(e) => {
                    tracing::error!("Protocol error from {}: {}", self.peer_addr, e);
                    // Clear buffer on error to try to recover
                    self.buffer.clear();
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle channel close
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.channels.remove(&channel);

        // All channels gone means the tunnel is done
        if self.channels.is_empty() {
            self.connection_lost();
        }

        Ok(())
    }

    /// Handle channel EOF
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        Ok(())
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a new server configuration with the given host key
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::ResponsePayload;

    fn authed_handler(state: &Arc<BrokerState>) -> ClientHandler {
        let addr: SocketAddr = "127.0.0.1:4200".parse().unwrap();
        let mut handler = ClientHandler::new(Arc::clone(state), CancellationToken::new(), addr);
        handler.fingerprint = Some("SHA256:aaa".to_string());
        handler
    }

    #[tokio::test]
    async fn test_register_frame_without_version_creates_record() {
        let state = Arc::new(BrokerState::for_tests());
        let mut handler = authed_handler(&state);

        let frame = Frame::new(
            RequestId::CONTROL,
            Message::Register {
                machine_id: None,
                hostname: "host1".to_string(),
                platform: "linux".to_string(),
                capabilities: vec![],
                version: None,
            },
        );
        handler.handle_frame(frame).await;

        let machine_id = handler.machine_id.clone().expect("registration sets the id");
        assert!(state.directory.get(&machine_id).unwrap().online);
        assert!(state.pool.get(&machine_id).is_some());
    }

    #[tokio::test]
    async fn test_response_frame_resolves_pending_request() {
        let state = Arc::new(BrokerState::for_tests());
        let mut handler = authed_handler(&state);

        let frame = Frame::new(
            RequestId::CONTROL,
            Message::Register {
                machine_id: None,
                hostname: "host1".to_string(),
                platform: "linux".to_string(),
                capabilities: vec![],
                version: Some("0.1.0".to_string()),
            },
        );
        handler.handle_frame(frame).await;

        let machine_id = handler.machine_id.clone().unwrap();
        let tunnel = state.pool.get(&machine_id).unwrap();
        let request_id = tunnel.next_request_id();
        let rx = tunnel.register_pending(request_id);

        handler
            .handle_frame(Frame::new(
                request_id,
                Message::Response {
                    success: true,
                    payload: Some(ResponsePayload::Empty),
                    error: None,
                    duration_ms: 1,
                },
            ))
            .await;

        let message = rx.await.unwrap();
        assert!(matches!(message, Message::Response { success: true, .. }));
    }
}
