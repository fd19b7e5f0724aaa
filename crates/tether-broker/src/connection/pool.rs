//! Connection pool and tunnel handles
//!
//! One `TunnelHandle` per live tunnel, indexed by machine id. The handle
//! owns the command channel toward the agent and the correlation state
//! for in-flight requests, so many operations can be outstanding on one
//! tunnel without blocking each other.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tether_core::{DispatchError, MachineId};
use tether_protocol::{Frame, Message, Operation, RequestId, ResponsePayload};

/// Commands sent toward an agent's tunnel writer task
#[derive(Debug)]
pub enum AgentCommand {
    /// A remote operation request
    Request {
        request_id: RequestId,
        op: Operation,
    },
    /// A file-transfer chunk (broker -> agent upload)
    Chunk {
        request_id: RequestId,
        data: Bytes,
    },
    /// End of an upload stream
    ChunkEnd {
        request_id: RequestId,
        size: u64,
    },
    /// Heartbeat ping
    Heartbeat { timestamp: u64 },
    /// Registration acknowledgment
    RegisterAck {
        accepted: bool,
        machine_id: String,
        quarantined: bool,
        reason: Option<String>,
    },
}

impl AgentCommand {
    /// Convert to a wire frame
    pub fn to_frame(&self) -> Frame {
        match self {
            AgentCommand::Request { request_id, op } => {
                Frame::new(*request_id, Message::Request { op: op.clone() })
            }
            AgentCommand::Chunk { request_id, data } => {
                Frame::new(*request_id, Message::FileChunk(data.clone()))
            }
            AgentCommand::ChunkEnd { request_id, size } => {
                Frame::new(*request_id, Message::FileDone { size: *size })
            }
            AgentCommand::Heartbeat { timestamp } => Frame::new(
                RequestId::CONTROL,
                Message::Heartbeat {
                    timestamp: *timestamp,
                },
            ),
            AgentCommand::RegisterAck {
                accepted,
                machine_id,
                quarantined,
                reason,
            } => Frame::new(
                RequestId::CONTROL,
                Message::RegisterAck {
                    accepted: *accepted,
                    machine_id: machine_id.clone(),
                    quarantined: *quarantined,
                    reason: reason.clone(),
                },
            ),
        }
    }
}

/// Parsed agent response to a remote operation
#[derive(Debug)]
pub struct AgentResponse {
    /// Whether the operation succeeded on the agent
    pub success: bool,
    /// Result data when successful
    pub payload: Option<ResponsePayload>,
    /// Error description when unsuccessful
    pub error: Option<String>,
    /// Wall-clock duration on the agent, in milliseconds
    pub duration_ms: u64,
}

/// Events routed to an open download stream
#[derive(Debug)]
pub enum StreamEvent {
    /// A chunk of file data
    Chunk(Bytes),
    /// End of the stream with the total byte count
    Done(u64),
}

/// A live tunnel to a remote machine
pub struct TunnelHandle {
    /// Machine identifier
    pub machine_id: MachineId,
    /// Key fingerprint presented on this connect
    pub fingerprint: String,
    /// Channel for sending commands to this agent
    pub command_tx: mpsc::Sender<AgentCommand>,
    /// Token to cancel/disconnect this connection
    cancel: CancellationToken,
    /// Next request id (0 is reserved for control traffic)
    next_request: AtomicU32,
    /// In-flight requests awaiting a response
    pending: DashMap<RequestId, oneshot::Sender<Message>>,
    /// Open download streams awaiting chunks
    streams: DashMap<RequestId, mpsc::Sender<StreamEvent>>,
    /// Last heartbeat ack, unix millis
    last_heartbeat: AtomicU64,
    /// Whether the machine is quarantined by a key mismatch
    quarantined: AtomicBool,
}

impl TunnelHandle {
    /// Create a handle for a newly established tunnel
    pub fn new(
        machine_id: MachineId,
        fingerprint: String,
        command_tx: mpsc::Sender<AgentCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine_id,
            fingerprint,
            command_tx,
            cancel,
            next_request: AtomicU32::new(1),
            pending: DashMap::new(),
            streams: DashMap::new(),
            last_heartbeat: AtomicU64::new(tether_core::time::current_time_millis()),
            quarantined: AtomicBool::new(false),
        }
    }

    /// Allocate a fresh request id, skipping the reserved control id
    pub fn next_request_id(&self) -> RequestId {
        loop {
            let id = self.next_request.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return RequestId::new(id);
            }
        }
    }

    /// Send a remote operation and await its response.
    ///
    /// A timeout cancels the logical call (the agent may still complete
    /// it) and surfaces `Timeout`; tunnel loss surfaces `Unreachable`.
    pub async fn call(
        &self,
        op: Operation,
        timeout: Duration,
    ) -> Result<AgentResponse, DispatchError> {
        let request_id = self.next_request_id();
        let rx = self.register_pending(request_id);

        self.send(AgentCommand::Request { request_id, op }).await?;

        self.await_response(request_id, rx, timeout).await
    }

    /// Register interest in the response for a request id
    pub fn register_pending(&self, request_id: RequestId) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        rx
    }

    /// Await a previously registered response
    pub async fn await_response(
        &self,
        request_id: RequestId,
        rx: oneshot::Receiver<Message>,
        timeout: Duration,
    ) -> Result<AgentResponse, DispatchError> {
        let message = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                // Sender dropped: the tunnel was lost mid-call
                return Err(DispatchError::Unreachable(self.machine_id.to_string()));
            }
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(DispatchError::Timeout {
                    machine: self.machine_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        match message {
            Message::Response {
                success,
                payload,
                error,
                duration_ms,
            } => Ok(AgentResponse {
                success,
                payload,
                error,
                duration_ms,
            }),
            Message::Error { message, .. } => Err(DispatchError::Remote(message)),
            other => Err(DispatchError::InvalidArgument(format!(
                "unexpected message type {:?} in response",
                other.message_type()
            ))),
        }
    }

    /// Open a download stream for a request id. Must be called before the
    /// request is sent so no chunk can race past the registration.
    pub fn open_stream(&self, request_id: RequestId) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.streams.insert(request_id, tx);
        rx
    }

    /// Drop a stream registration
    pub fn close_stream(&self, request_id: RequestId) {
        self.streams.remove(&request_id);
    }

    /// Send a command to the agent's writer task
    pub async fn send(&self, command: AgentCommand) -> Result<(), DispatchError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DispatchError::Unreachable(self.machine_id.to_string()))
    }

    /// Route an inbound frame to whoever is waiting on its request id.
    ///
    /// Responses complete a pending call; chunks and done markers feed an
    /// open stream. Unmatched frames are dropped (a late response after a
    /// timeout is normal).
    pub async fn complete(&self, request_id: RequestId, message: Message) {
        match &message {
            Message::Response { .. } | Message::Error { .. } => {
                if let Some((_, tx)) = self.pending.remove(&request_id) {
                    let _ = tx.send(message);
                } else {
                    tracing::debug!(
                        "Dropping late response for {} on {}",
                        request_id,
                        self.machine_id
                    );
                }
            }
            Message::FileChunk(data) => {
                if let Some(stream) = self.streams.get(&request_id) {
                    let _ = stream.send(StreamEvent::Chunk(data.clone())).await;
                }
            }
            Message::FileDone { size } => {
                if let Some((_, stream)) = self.streams.remove(&request_id) {
                    let _ = stream.send(StreamEvent::Done(*size)).await;
                }
            }
            other => {
                tracing::warn!(
                    "Unroutable message type {:?} from {}",
                    other.message_type(),
                    self.machine_id
                );
            }
        }
    }

    /// Fail every in-flight call and open stream with Unreachable.
    /// Called when the tunnel is lost; dropping the senders closes the
    /// receivers, which callers observe as a connectivity error.
    pub fn fail_pending(&self) {
        let count = self.pending.len() + self.streams.len();
        self.pending.clear();
        self.streams.clear();
        if count > 0 {
            tracing::warn!(
                "Failed {} in-flight operations on {} after tunnel loss",
                count,
                self.machine_id
            );
        }
    }

    /// Record a heartbeat acknowledgment
    pub fn record_heartbeat(&self) {
        self.last_heartbeat
            .store(tether_core::time::current_time_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last heartbeat acknowledgment
    pub fn heartbeat_age_millis(&self) -> u64 {
        tether_core::time::elapsed_millis(self.last_heartbeat.load(Ordering::Relaxed))
    }

    /// Mark or clear the key-mismatch quarantine
    pub fn set_quarantined(&self, quarantined: bool) {
        self.quarantined.store(quarantined, Ordering::Relaxed);
    }

    /// Whether the machine is quarantined
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Relaxed)
    }

    /// Signal the connection to close
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// Pool of live tunnels indexed by machine ID
#[derive(Default)]
pub struct ConnectionPool {
    connections: DashMap<MachineId, Arc<TunnelHandle>>,
}

impl ConnectionPool {
    /// Create a new empty connection pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel, returning the previous handle if the machine
    /// was already connected (the caller decides what to do with it)
    pub fn insert(&self, handle: TunnelHandle) -> Option<Arc<TunnelHandle>> {
        self.connections
            .insert(handle.machine_id.clone(), Arc::new(handle))
    }

    /// Get a tunnel by machine ID
    pub fn get(&self, machine_id: &MachineId) -> Option<Arc<TunnelHandle>> {
        self.connections.get(machine_id).map(|r| Arc::clone(&r))
    }

    /// Remove a tunnel
    pub fn remove(&self, machine_id: &MachineId) -> Option<Arc<TunnelHandle>> {
        self.connections.remove(machine_id).map(|(_, h)| h)
    }

    /// List all live tunnels
    pub fn list(&self) -> Vec<Arc<TunnelHandle>> {
        self.connections.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Number of live tunnels
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if pool is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
