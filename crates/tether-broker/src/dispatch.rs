//! Command dispatcher
//!
//! Every remote operation flows through here. Path-bearing operations run
//! the same check ladder before the pool is consulted: the record must be
//! trusted and online, the path must fall under an allowed prefix, and the
//! rate limiter admits the call (warn-only, so admission never fails).
//! The rate slot is held as an RAII guard so it is released on every exit
//! path, including timeouts and tunnel loss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tether_core::control::{BrokerStatus, CommandResult, RateStats, TransferDirection};
use tether_core::machine::{MachineQuery, MachineRecord, MachineSummary, MachineUpdate};
use tether_core::{DispatchError, MachineId};
use tether_protocol::{FileEntry, MetricsReport, Operation, ResponsePayload};

use crate::connection::{AgentCommand, AgentResponse, StreamEvent, TunnelHandle};
use crate::ratelimit::{RateGuard, RateLimits};
use crate::state::BrokerState;
use crate::webhook::WebhookEvent;

/// Chunk size for streaming file transfers
const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Capability an agent must advertise for streaming transfers
const STREAM_CAPABILITY: &str = "fs-stream";

/// Drives remote operations against the fleet
pub struct Dispatcher {
    state: Arc<BrokerState>,
    started_at: Instant,
}

impl Dispatcher {
    /// Create a dispatcher over the shared broker state
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self {
            state,
            started_at: Instant::now(),
        }
    }

    /// Resolve a target name to a machine id.
    ///
    /// An explicit identity always wins; the selected default is consulted
    /// only when none is supplied.
    fn resolve_id(&self, machine: Option<&str>) -> Result<MachineId, DispatchError> {
        match machine {
            Some(name) => {
                let id = MachineId::new(name);
                if self.state.directory.contains(&id) {
                    Ok(id)
                } else {
                    Err(DispatchError::NotFound(name.to_string()))
                }
            }
            None => self
                .state
                .manager
                .selected()
                .ok_or_else(|| DispatchError::InvalidArgument("no machine selected".to_string())),
        }
    }

    /// Resolve a target name to its current record
    fn target_record(&self, machine: Option<&str>) -> Result<MachineRecord, DispatchError> {
        let id = self.resolve_id(machine)?;
        self.state
            .directory
            .get(&id)
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    /// First rung of the check ladder: the machine must be online and its
    /// key must not be pending acceptance
    fn require_trusted_online(&self, record: &MachineRecord) -> Result<(), DispatchError> {
        if !record.online {
            return Err(DispatchError::Offline(record.id.to_string()));
        }
        if record.key_mismatch {
            return Err(DispatchError::NotTrusted(record.id.to_string()));
        }
        Ok(())
    }

    /// Second rung: path must fall under an allowed prefix
    fn require_path(&self, record: &MachineRecord, path: &str) -> Result<(), DispatchError> {
        if record.path_permitted(path) {
            Ok(())
        } else {
            Err(DispatchError::Unauthorized {
                path: path.to_string(),
            })
        }
    }

    /// Effective rate limits for a record (per-machine override or global)
    fn limits_for(&self, record: &MachineRecord) -> RateLimits {
        RateLimits {
            rpm: record
                .rate_limit_rpm
                .unwrap_or(self.state.config.default_rate_limit_rpm),
            concurrent: record
                .rate_limit_concurrent
                .unwrap_or(self.state.config.default_rate_limit_concurrent),
        }
    }

    /// Third rung: take a rate slot (always granted, warn-only)
    fn admit(&self, record: &MachineRecord) -> RateGuard {
        self.state
            .limiter
            .admit_guarded(&record.id, self.limits_for(record))
    }

    fn per_call_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.state.config.default_timeout)
    }

    /// Unwrap an agent response, surfacing agent-side failures as Remote
    fn expect_success(response: AgentResponse) -> Result<Option<ResponsePayload>, DispatchError> {
        if response.success {
            Ok(response.payload)
        } else {
            Err(DispatchError::Remote(
                response.error.unwrap_or_else(|| "unspecified".to_string()),
            ))
        }
    }

    /// Execute a command on a machine.
    ///
    /// The command string is forwarded verbatim; the agent's platform shell
    /// interprets it. A non-zero exit code is a successful dispatch.
    pub async fn run(
        &self,
        machine: Option<&str>,
        command: String,
        working_dir: Option<String>,
        env: Vec<(String, String)>,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, DispatchError> {
        let record = self.target_record(machine)?;
        self.require_trusted_online(&record)?;
        let _guard = self.admit(&record);

        let handle = self.state.manager.resolve(Some(&record.id))?;
        let timeout = self.per_call_timeout(timeout_ms);

        let started = Instant::now();
        let response = handle
            .call(
                Operation::Exec {
                    command: command.clone(),
                    working_dir,
                    env,
                    timeout_ms: timeout.as_millis() as u64,
                },
                timeout,
            )
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match Self::expect_success(response)? {
            Some(ResponsePayload::Exec {
                stdout,
                stderr,
                exit_code,
            }) => CommandResult {
                stdout,
                stderr,
                exit_code,
                duration_ms,
            },
            other => {
                return Err(DispatchError::InvalidArgument(format!(
                    "unexpected exec payload: {:?}",
                    other
                )))
            }
        };

        self.state.webhooks.emit(
            WebhookEvent::CommandExecuted,
            &record,
            serde_json::json!({
                "command": command,
                "exitCode": result.exit_code,
                "durationMs": duration_ms,
            }),
        );

        Ok(result)
    }

    /// Read a file inline, bounded by the inline ceiling
    pub async fn read_file(
        &self,
        machine: Option<&str>,
        path: String,
        size_limit: Option<u64>,
    ) -> Result<Vec<u8>, DispatchError> {
        let record = self.target_record(machine)?;
        self.require_trusted_online(&record)?;
        self.require_path(&record, &path)?;
        let _guard = self.admit(&record);

        let handle = self.state.manager.resolve(Some(&record.id))?;

        let ceiling = self.state.config.max_inline_file_size;
        let limit = size_limit.unwrap_or(ceiling).min(ceiling);

        let response = handle
            .call(
                Operation::ReadFile {
                    path: path.clone(),
                    size_limit: limit,
                },
                self.state.config.default_timeout,
            )
            .await?;

        let content = match Self::expect_success(response)? {
            Some(ResponsePayload::FileData { content }) => content,
            other => {
                return Err(DispatchError::InvalidArgument(format!(
                    "unexpected read payload: {:?}",
                    other
                )))
            }
        };

        // The agent is supposed to honor size_limit; enforce the ceiling
        // broker-side as well
        if content.len() as u64 > ceiling {
            return Err(DispatchError::SizeExceeded {
                size: content.len() as u64,
                max: ceiling,
            });
        }

        self.audit_file(&record, &path, "read", content.len() as u64);
        Ok(content.to_vec())
    }

    /// Write a file inline, bounded by the inline ceiling
    pub async fn write_file(
        &self,
        machine: Option<&str>,
        path: String,
        content: Vec<u8>,
    ) -> Result<(), DispatchError> {
        let record = self.target_record(machine)?;
        self.require_trusted_online(&record)?;
        self.require_path(&record, &path)?;

        let ceiling = self.state.config.max_inline_file_size;
        if content.len() as u64 > ceiling {
            return Err(DispatchError::SizeExceeded {
                size: content.len() as u64,
                max: ceiling,
            });
        }

        let _guard = self.admit(&record);
        let handle = self.state.manager.resolve(Some(&record.id))?;

        let size = content.len() as u64;
        let response = handle
            .call(
                Operation::WriteFile {
                    path: path.clone(),
                    content: Bytes::from(content),
                },
                self.state.config.default_timeout,
            )
            .await?;
        Self::expect_success(response)?;

        self.audit_file(&record, &path, "write", size);
        Ok(())
    }

    /// List directory entries on a machine
    pub async fn list_files(
        &self,
        machine: Option<&str>,
        path: String,
    ) -> Result<Vec<FileEntry>, DispatchError> {
        let record = self.target_record(machine)?;
        self.require_trusted_online(&record)?;
        self.require_path(&record, &path)?;
        let _guard = self.admit(&record);

        let handle = self.state.manager.resolve(Some(&record.id))?;
        let response = handle
            .call(
                Operation::ListFiles { path: path.clone() },
                self.state.config.default_timeout,
            )
            .await?;

        match Self::expect_success(response)? {
            Some(ResponsePayload::FileList { entries }) => {
                self.audit_file(&record, &path, "list", entries.len() as u64);
                Ok(entries)
            }
            other => Err(DispatchError::InvalidArgument(format!(
                "unexpected list payload: {:?}",
                other
            ))),
        }
    }

    /// Fetch a health snapshot. The broker passes the values through
    /// without interpreting them.
    pub async fn metrics(
        &self,
        machine: Option<&str>,
        summary: bool,
    ) -> Result<MetricsReport, DispatchError> {
        let record = self.target_record(machine)?;
        self.require_trusted_online(&record)?;
        let _guard = self.admit(&record);

        let handle = self.state.manager.resolve(Some(&record.id))?;
        let response = handle
            .call(
                Operation::Metrics { summary },
                self.state.config.default_timeout,
            )
            .await?;

        match Self::expect_success(response)? {
            Some(ResponsePayload::Metrics(report)) => Ok(report),
            other => Err(DispatchError::InvalidArgument(format!(
                "unexpected metrics payload: {:?}",
                other
            ))),
        }
    }

    /// Streaming file transfer between the broker host and a machine.
    ///
    /// Agents advertising the streaming capability always use the chunked
    /// path, which has no size ceiling. Without the capability the
    /// transfer falls back to the inline protocol and is bounded by the
    /// inline ceiling.
    pub async fn transfer_file(
        &self,
        machine: Option<&str>,
        direction: TransferDirection,
        local_path: String,
        remote_path: String,
    ) -> Result<u64, DispatchError> {
        let record = self.target_record(machine)?;
        self.require_trusted_online(&record)?;
        self.require_path(&record, &remote_path)?;
        let _guard = self.admit(&record);

        let handle = self.state.manager.resolve(Some(&record.id))?;
        let streaming = record.capabilities.contains(STREAM_CAPABILITY);

        let bytes = match direction {
            TransferDirection::Download => {
                if streaming {
                    self.download_streamed(&handle, &local_path, &remote_path)
                        .await?
                } else {
                    self.download_inline(&handle, &local_path, &remote_path)
                        .await?
                }
            }
            TransferDirection::Upload => {
                if streaming {
                    self.upload_streamed(&handle, &local_path, &remote_path)
                        .await?
                } else {
                    self.upload_inline(&handle, &local_path, &remote_path)
                        .await?
                }
            }
        };

        self.audit_file(
            &record,
            &remote_path,
            match direction {
                TransferDirection::Upload => "upload",
                TransferDirection::Download => "download",
            },
            bytes,
        );
        Ok(bytes)
    }

    /// Chunked download: SendFile, then FileChunk frames until FileDone
    async fn download_streamed(
        &self,
        handle: &TunnelHandle,
        local_path: &str,
        remote_path: &str,
    ) -> Result<u64, DispatchError> {
        let timeout = self.state.config.default_timeout;
        let request_id = handle.next_request_id();

        // Stream registration must precede the request so no chunk can
        // race past it
        let rx = handle.register_pending(request_id);
        let mut chunks = handle.open_stream(request_id);

        if let Err(e) = handle
            .send(AgentCommand::Request {
                request_id,
                op: Operation::SendFile {
                    path: remote_path.to_string(),
                },
            })
            .await
        {
            handle.close_stream(request_id);
            return Err(e);
        }

        let accepted = handle.await_response(request_id, rx, timeout).await;
        match accepted.and_then(Self::expect_success) {
            Ok(Some(ResponsePayload::Accepted)) => {}
            Ok(other) => {
                handle.close_stream(request_id);
                return Err(DispatchError::InvalidArgument(format!(
                    "unexpected stream payload: {:?}",
                    other
                )));
            }
            Err(e) => {
                handle.close_stream(request_id);
                return Err(e);
            }
        }

        let mut file = tokio::fs::File::create(local_path).await.map_err(|e| {
            handle.close_stream(request_id);
            DispatchError::InvalidArgument(format!("cannot create {}: {}", local_path, e))
        })?;

        let mut written: u64 = 0;
        loop {
            let event = match tokio::time::timeout(timeout, chunks.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(DispatchError::Unreachable(handle.machine_id.to_string()));
                }
                Err(_) => {
                    handle.close_stream(request_id);
                    return Err(DispatchError::Timeout {
                        machine: handle.machine_id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            };

            match event {
                StreamEvent::Chunk(data) => {
                    written += data.len() as u64;
                    file.write_all(&data).await.map_err(|e| {
                        handle.close_stream(request_id);
                        DispatchError::InvalidArgument(format!(
                            "cannot write {}: {}",
                            local_path, e
                        ))
                    })?;
                }
                StreamEvent::Done(size) => {
                    file.flush().await.map_err(|e| {
                        DispatchError::InvalidArgument(format!(
                            "cannot flush {}: {}",
                            local_path, e
                        ))
                    })?;
                    if size != written {
                        tracing::warn!(
                            "Stream from {} reported {} bytes, wrote {}",
                            handle.machine_id,
                            size,
                            written
                        );
                    }
                    return Ok(written);
                }
            }
        }
    }

    /// Inline download fallback, bounded by the inline ceiling
    async fn download_inline(
        &self,
        handle: &TunnelHandle,
        local_path: &str,
        remote_path: &str,
    ) -> Result<u64, DispatchError> {
        let ceiling = self.state.config.max_inline_file_size;
        let response = handle
            .call(
                Operation::ReadFile {
                    path: remote_path.to_string(),
                    size_limit: ceiling,
                },
                self.state.config.default_timeout,
            )
            .await?;

        let content = match Self::expect_success(response)? {
            Some(ResponsePayload::FileData { content }) => content,
            other => {
                return Err(DispatchError::InvalidArgument(format!(
                    "unexpected read payload: {:?}",
                    other
                )))
            }
        };

        if content.len() as u64 > ceiling {
            return Err(DispatchError::SizeExceeded {
                size: content.len() as u64,
                max: ceiling,
            });
        }

        tokio::fs::write(local_path, &content).await.map_err(|e| {
            DispatchError::InvalidArgument(format!("cannot write {}: {}", local_path, e))
        })?;
        Ok(content.len() as u64)
    }

    /// Chunked upload: ReceiveFile, then FileChunk frames, then FileDone,
    /// then a final confirmation from the agent
    async fn upload_streamed(
        &self,
        handle: &TunnelHandle,
        local_path: &str,
        remote_path: &str,
    ) -> Result<u64, DispatchError> {
        let timeout = self.state.config.default_timeout;
        let request_id = handle.next_request_id();

        let rx = handle.register_pending(request_id);
        handle
            .send(AgentCommand::Request {
                request_id,
                op: Operation::ReceiveFile {
                    path: remote_path.to_string(),
                },
            })
            .await?;

        let accepted = handle.await_response(request_id, rx, timeout).await;
        match accepted.and_then(Self::expect_success)? {
            Some(ResponsePayload::Accepted) => {}
            other => {
                return Err(DispatchError::InvalidArgument(format!(
                    "unexpected stream payload: {:?}",
                    other
                )))
            }
        }

        let mut file = tokio::fs::File::open(local_path).await.map_err(|e| {
            DispatchError::InvalidArgument(format!("cannot open {}: {}", local_path, e))
        })?;

        // The agent confirms the completed write on the same request id
        let done_rx = handle.register_pending(request_id);

        let mut sent: u64 = 0;
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| {
                DispatchError::InvalidArgument(format!("cannot read {}: {}", local_path, e))
            })?;
            if n == 0 {
                break;
            }
            sent += n as u64;
            handle
                .send(AgentCommand::Chunk {
                    request_id,
                    data: Bytes::copy_from_slice(&buf[..n]),
                })
                .await?;
        }

        handle
            .send(AgentCommand::ChunkEnd {
                request_id,
                size: sent,
            })
            .await?;

        let confirmation = handle.await_response(request_id, done_rx, timeout).await?;
        Self::expect_success(confirmation)?;
        Ok(sent)
    }

    /// Inline upload fallback, bounded by the inline ceiling
    async fn upload_inline(
        &self,
        handle: &TunnelHandle,
        local_path: &str,
        remote_path: &str,
    ) -> Result<u64, DispatchError> {
        let content = tokio::fs::read(local_path).await.map_err(|e| {
            DispatchError::InvalidArgument(format!("cannot read {}: {}", local_path, e))
        })?;

        let ceiling = self.state.config.max_inline_file_size;
        if content.len() as u64 > ceiling {
            return Err(DispatchError::SizeExceeded {
                size: content.len() as u64,
                max: ceiling,
            });
        }

        let size = content.len() as u64;
        let response = handle
            .call(
                Operation::WriteFile {
                    path: remote_path.to_string(),
                    content: Bytes::from(content),
                },
                self.state.config.default_timeout,
            )
            .await?;
        Self::expect_success(response)?;
        Ok(size)
    }

    /// Full record for a machine
    pub fn describe(&self, machine: Option<&str>) -> Result<MachineRecord, DispatchError> {
        self.target_record(machine)
    }

    /// Find machines matching every supplied criterion
    pub fn find(&self, query: &MachineQuery) -> Vec<MachineSummary> {
        self.state.directory.find(query)
    }

    /// Merge a partial metadata update into a record
    pub fn update(
        &self,
        machine: Option<&str>,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, DispatchError> {
        let id = self.resolve_id(machine)?;
        self.state.directory.update(&id, update)
    }

    /// Apply policy overrides (webhook URL, rate limits)
    pub fn configure(
        &self,
        machine: Option<&str>,
        webhook_url: Option<&str>,
        rate_limit_rpm: Option<u32>,
        rate_limit_concurrent: Option<u32>,
    ) -> Result<MachineRecord, DispatchError> {
        let id = self.resolve_id(machine)?;
        self.state
            .directory
            .configure(&id, webhook_url, rate_limit_rpm, rate_limit_concurrent)
    }

    /// Set the process-wide selected machine default
    pub fn select(&self, machine: &str) -> Result<(), DispatchError> {
        self.state.manager.select(&MachineId::new(machine))
    }

    /// Accept a machine's changed key fingerprint and lift the quarantine
    pub fn accept_key(&self, machine: Option<&str>) -> Result<(), DispatchError> {
        let id = self.resolve_id(machine)?;
        self.state.trust.accept(&id)?;
        self.state.manager.clear_quarantine(&id);
        Ok(())
    }

    /// Rate-limiter statistics for a machine
    pub fn rate_stats(&self, machine: Option<&str>) -> Result<RateStats, DispatchError> {
        let record = self.target_record(machine)?;
        let limits = self.limits_for(&record);
        Ok(self.state.limiter.stats(&record.id, limits))
    }

    /// Broker status snapshot
    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            running: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
            machine_count: self.state.directory.len(),
            online_count: self.state.directory.online_count(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bind_address: self.state.config.bind_address.clone(),
        }
    }

    /// Best-effort audit event for file access
    fn audit_file(&self, record: &MachineRecord, path: &str, op: &str, bytes: u64) {
        self.state.webhooks.emit(
            WebhookEvent::FileAccessed,
            record,
            serde_json::json!({
                "path": path,
                "op": op,
                "bytes": bytes,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Spawns a fake agent loop answering every request with the closure's
    /// payload, so dispatcher paths can be driven without a network.
    fn connect_agent(
        state: &Arc<BrokerState>,
        hostname: &str,
        fingerprint: &str,
        capabilities: Vec<String>,
        respond: impl Fn(Operation) -> ResponsePayload + Send + 'static,
    ) -> MachineId {
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = state
            .manager
            .register(
                None,
                hostname.to_string(),
                "linux".to_string(),
                capabilities,
                fingerprint.to_string(),
                tx,
                CancellationToken::new(),
            )
            .unwrap();

        let pool = Arc::clone(&state.pool);
        let machine_id = outcome.machine_id.clone();
        let agent_id = machine_id.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let AgentCommand::Request { request_id, op } = command {
                    let Some(handle) = pool.get(&agent_id) else {
                        break;
                    };
                    handle
                        .complete(
                            request_id,
                            tether_protocol::Message::Response {
                                success: true,
                                payload: Some(respond(op)),
                                error: None,
                                duration_ms: 1,
                            },
                        )
                        .await;
                }
            }
        });

        machine_id
    }

    fn echo_agent(op: Operation) -> ResponsePayload {
        match op {
            Operation::Exec { command, .. } => ResponsePayload::Exec {
                stdout: format!("ran: {}", command),
                stderr: String::new(),
                exit_code: Some(0),
            },
            Operation::ReadFile { .. } => ResponsePayload::FileData {
                content: Bytes::from_static(b"file body"),
            },
            Operation::WriteFile { .. } => ResponsePayload::Empty,
            Operation::ListFiles { .. } => ResponsePayload::FileList { entries: vec![] },
            Operation::Metrics { .. } => {
                ResponsePayload::Metrics(MetricsReport::Summary(Default::default()))
            }
            Operation::SendFile { .. } | Operation::ReceiveFile { .. } => {
                ResponsePayload::Accepted
            }
        }
    }

    #[tokio::test]
    async fn test_run_returns_command_result() {
        let state = Arc::new(BrokerState::for_tests());
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let result = dispatcher
            .run(Some(id.as_str()), "uptime".to_string(), None, vec![], None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "ran: uptime");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_offline_machine_is_rejected_before_dispatch() {
        let state = Arc::new(BrokerState::for_tests());
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        state.manager.unregister(&id);
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let result = dispatcher
            .run(Some(id.as_str()), "uptime".to_string(), None, vec![], None)
            .await;
        assert!(matches!(result, Err(DispatchError::Offline(_))));
    }

    #[tokio::test]
    async fn test_unauthorized_path_is_rejected() {
        let state = Arc::new(BrokerState::for_tests());
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        state
            .directory
            .update(
                &id,
                &MachineUpdate {
                    allowed_paths: Some(vec!["/opt/app".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let denied = dispatcher
            .read_file(Some(id.as_str()), "/etc/passwd".to_string(), None)
            .await;
        assert!(matches!(denied, Err(DispatchError::Unauthorized { .. })));

        let permitted = dispatcher
            .read_file(Some(id.as_str()), "/opt/app/data.txt".to_string(), None)
            .await
            .unwrap();
        assert_eq!(permitted, b"file body");
    }

    #[tokio::test]
    async fn test_quarantined_machine_is_not_trusted() {
        let state = Arc::new(BrokerState::for_tests());
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        state.manager.unregister(&id);
        // Reconnect with a different key
        let id2 = {
            let (tx, _rx) = mpsc::channel(8);
            std::mem::forget(_rx);
            state
                .manager
                .register(
                    Some(id.to_string()),
                    "host1".to_string(),
                    "linux".to_string(),
                    vec![],
                    "SHA256:bbb".to_string(),
                    tx,
                    CancellationToken::new(),
                )
                .unwrap()
                .machine_id
        };
        assert_eq!(id, id2);
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let result = dispatcher
            .run(Some(id.as_str()), "uptime".to_string(), None, vec![], None)
            .await;
        assert!(matches!(result, Err(DispatchError::NotTrusted(_))));

        // Metadata stays observable while quarantined
        assert!(dispatcher.describe(Some(id.as_str())).is_ok());
    }

    #[tokio::test]
    async fn test_inline_write_over_ceiling_is_size_exceeded() {
        let state = Arc::new(BrokerState::for_tests());
        let ceiling = state.config.max_inline_file_size;
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let content = vec![0u8; (ceiling + 1) as usize];
        let result = dispatcher
            .write_file(Some(id.as_str()), "/tmp/big".to_string(), content)
            .await;
        assert!(matches!(result, Err(DispatchError::SizeExceeded { .. })));
    }

    #[tokio::test]
    async fn test_selected_default_used_when_no_identity() {
        let state = Arc::new(BrokerState::for_tests());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let nothing = dispatcher.describe(None);
        assert!(matches!(nothing, Err(DispatchError::InvalidArgument(_))));

        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        dispatcher.select(id.as_str()).unwrap();
        assert_eq!(dispatcher.describe(None).unwrap().id, id);
    }

    #[tokio::test]
    async fn test_streaming_download_writes_local_file() {
        let state = Arc::new(BrokerState::for_tests());
        let (tx, mut rx) = mpsc::channel(64);
        let id = state
            .manager
            .register(
                None,
                "host1".to_string(),
                "linux".to_string(),
                vec![STREAM_CAPABILITY.to_string()],
                "SHA256:aaa".to_string(),
                tx,
                CancellationToken::new(),
            )
            .unwrap()
            .machine_id;

        let pool = Arc::clone(&state.pool);
        let agent_id = id.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let AgentCommand::Request { request_id, .. } = command {
                    let handle = pool.get(&agent_id).unwrap();
                    handle
                        .complete(
                            request_id,
                            tether_protocol::Message::Response {
                                success: true,
                                payload: Some(ResponsePayload::Accepted),
                                error: None,
                                duration_ms: 0,
                            },
                        )
                        .await;
                    handle
                        .complete(
                            request_id,
                            tether_protocol::Message::FileChunk(Bytes::from_static(b"hello ")),
                        )
                        .await;
                    handle
                        .complete(
                            request_id,
                            tether_protocol::Message::FileChunk(Bytes::from_static(b"world")),
                        )
                        .await;
                    handle
                        .complete(request_id, tether_protocol::Message::FileDone { size: 11 })
                        .await;
                }
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.bin");
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let bytes = dispatcher
            .transfer_file(
                Some(id.as_str()),
                TransferDirection::Download,
                local.to_string_lossy().into_owned(),
                "/data/file".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 11);
        assert_eq!(std::fs::read(&local).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_streaming_upload_sends_chunks_and_confirms() {
        let state = Arc::new(BrokerState::for_tests());
        let (tx, mut rx) = mpsc::channel(64);
        let id = state
            .manager
            .register(
                None,
                "host1".to_string(),
                "linux".to_string(),
                vec![STREAM_CAPABILITY.to_string()],
                "SHA256:aaa".to_string(),
                tx,
                CancellationToken::new(),
            )
            .unwrap()
            .machine_id;

        // Agent accepts the stream, tallies chunks, and confirms on end
        let pool = Arc::clone(&state.pool);
        let agent_id = id.clone();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<u64>();
        tokio::spawn(async move {
            let mut seen_tx = Some(seen_tx);
            let mut received: u64 = 0;
            while let Some(command) = rx.recv().await {
                let handle = pool.get(&agent_id).unwrap();
                match command {
                    AgentCommand::Request { request_id, .. } => {
                        handle
                            .complete(
                                request_id,
                                tether_protocol::Message::Response {
                                    success: true,
                                    payload: Some(ResponsePayload::Accepted),
                                    error: None,
                                    duration_ms: 0,
                                },
                            )
                            .await;
                    }
                    AgentCommand::Chunk { data, .. } => {
                        received += data.len() as u64;
                    }
                    AgentCommand::ChunkEnd { request_id, .. } => {
                        handle
                            .complete(
                                request_id,
                                tether_protocol::Message::Response {
                                    success: true,
                                    payload: Some(ResponsePayload::Empty),
                                    error: None,
                                    duration_ms: 0,
                                },
                            )
                            .await;
                        if let Some(seen_tx) = seen_tx.take() {
                            let _ = seen_tx.send(received);
                        }
                    }
                    _ => {}
                }
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("in.bin");
        std::fs::write(&local, b"upload payload").unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let bytes = dispatcher
            .transfer_file(
                Some(id.as_str()),
                TransferDirection::Upload,
                local.to_string_lossy().into_owned(),
                "/data/in.bin".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 14);
        assert_eq!(seen_rx.await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_transfer_falls_back_to_inline_without_stream_capability() {
        let state = Arc::new(BrokerState::for_tests());
        // No capabilities, so both directions take the inline path
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let dir = tempfile::tempdir().unwrap();
        let downloaded = dir.path().join("out.bin");
        let bytes = dispatcher
            .transfer_file(
                Some(id.as_str()),
                TransferDirection::Download,
                downloaded.to_string_lossy().into_owned(),
                "/data/file".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 9);
        assert_eq!(std::fs::read(&downloaded).unwrap(), b"file body");

        let uploaded = dir.path().join("in.bin");
        std::fs::write(&uploaded, b"upload payload").unwrap();
        let bytes = dispatcher
            .transfer_file(
                Some(id.as_str()),
                TransferDirection::Upload,
                uploaded.to_string_lossy().into_owned(),
                "/data/in.bin".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 14);
    }

    #[tokio::test]
    async fn test_inline_upload_over_ceiling_is_size_exceeded() {
        let state = Arc::new(BrokerState::for_tests());
        let id = connect_agent(&state, "host1", "SHA256:aaa", vec![], echo_agent);
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let ceiling = state.config.max_inline_file_size;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.bin");
        std::fs::write(&local, vec![0u8; ceiling as usize + 1]).unwrap();

        let result = dispatcher
            .transfer_file(
                Some(id.as_str()),
                TransferDirection::Upload,
                local.to_string_lossy().into_owned(),
                "/data/big.bin".to_string(),
            )
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::SizeExceeded { max, .. }) if max == ceiling
        ));
    }

    #[tokio::test]
    async fn test_rate_slot_released_after_timeout() {
        let state = Arc::new(BrokerState::for_tests());
        // Agent that never answers
        let (tx, _rx) = mpsc::channel(8);
        std::mem::forget(_rx);
        let id = state
            .manager
            .register(
                None,
                "host1".to_string(),
                "linux".to_string(),
                vec![],
                "SHA256:aaa".to_string(),
                tx,
                CancellationToken::new(),
            )
            .unwrap()
            .machine_id;
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        let result = dispatcher
            .run(
                Some(id.as_str()),
                "sleep 99".to_string(),
                None,
                vec![],
                Some(20),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::Timeout { .. })));

        let stats = dispatcher.rate_stats(Some(id.as_str())).unwrap();
        assert_eq!(stats.concurrent_current, 0);
    }
}
