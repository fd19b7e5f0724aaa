//! Message types for the Tether broker/agent protocol
//!
//! This module defines the high-level protocol messages exchanged between
//! the broker and remote agents. Messages are serialized into frames using
//! the codec defined in `codec.rs`.
//!
//! # Message Flow
//!
//! Typical sequence on one tunnel:
//!
//! 1. Agent connects and sends `Register` (echoing its assigned id when it
//!    has one; absent on first contact)
//! 2. Broker responds with `RegisterAck` carrying the stable machine id
//! 3. Broker sends `Heartbeat` periodically, agent responds with `HeartbeatAck`
//! 4. Broker issues `Request` frames with fresh request ids; the agent
//!    answers each with a `Response` carrying the same id
//! 5. File streaming: after a `SendFile`/`ReceiveFile` request is accepted,
//!    `FileChunk` frames flow under the same request id, closed by `FileDone`

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsReport;

/// Current protocol version string.
///
/// Included in `Register` so the broker can log and, if a breaking change
/// ever ships, reject incompatible agents.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Registration message (agent -> broker)
    Register = 0x01,
    /// Registration acknowledgment
    RegisterAck = 0x02,
    /// Heartbeat ping
    Heartbeat = 0x03,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x04,
    /// Remote operation request (broker -> agent)
    Request = 0x05,
    /// Remote operation response (agent -> broker)
    Response = 0x06,
    /// File transfer chunk (either direction)
    FileChunk = 0x07,
    /// End of file transfer
    FileDone = 0x08,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::HeartbeatAck),
            0x05 => Some(Self::Request),
            0x06 => Some(Self::Response),
            0x07 => Some(Self::FileChunk),
            0x08 => Some(Self::FileDone),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried by `Message::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Operation not supported by this agent
    Unsupported = 1,
    /// Remote execution failed before producing a result
    ExecutionFailed = 2,
    /// File not found or not accessible on the agent
    FileError = 3,
    /// Invalid message
    InvalidMessage = 4,
}

/// A remote operation the broker asks an agent to perform.
///
/// The broker treats every operation as opaque: command strings are
/// forwarded verbatim and metrics values are never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Execute a command and capture its output
    Exec {
        /// Opaque command string, interpreted by the agent's platform shell
        command: String,
        /// Working directory (None = agent default)
        working_dir: Option<String>,
        /// Environment variables to set for the command
        env: Vec<(String, String)>,
        /// Deadline hint for the agent; the broker enforces its own timeout
        timeout_ms: u64,
    },

    /// Read a file inline (bounded by `size_limit`)
    ReadFile {
        /// Absolute path on the agent
        path: String,
        /// Maximum number of bytes the agent may return
        size_limit: u64,
    },

    /// Write a file inline
    WriteFile {
        /// Absolute path on the agent
        path: String,
        /// File content
        content: Bytes,
    },

    /// List directory entries
    ListFiles {
        /// Absolute path on the agent
        path: String,
    },

    /// Fetch a health snapshot
    Metrics {
        /// Condensed snapshot when true, full detail otherwise
        summary: bool,
    },

    /// Ask the agent to stream a file to the broker (download)
    SendFile {
        /// Absolute path on the agent
        path: String,
    },

    /// Announce that the broker will stream a file to the agent (upload)
    ReceiveFile {
        /// Absolute path on the agent
        path: String,
    },
}

/// Structured result of a remote operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command execution result
    Exec {
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
        /// Process exit code (None if terminated by signal)
        exit_code: Option<i32>,
    },

    /// Inline file content
    FileData {
        /// File content
        content: Bytes,
    },

    /// Directory listing
    FileList {
        /// Entries in the directory
        entries: Vec<FileEntry>,
    },

    /// Health snapshot
    Metrics(MetricsReport),

    /// Streaming request accepted; chunks follow
    Accepted,

    /// Operation succeeded with no data (e.g. WriteFile)
    Empty,
}

/// A single directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (not the full path)
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Modification time, unix millis (0 if unavailable)
    pub modified: u64,
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Agent registration.
    ///
    /// Sent by the agent immediately after connecting to identify itself.
    /// The broker responds with `RegisterAck`.
    Register {
        /// Machine id assigned by the broker on a previous contact.
        /// Absent on first contact; the broker assigns one.
        machine_id: Option<String>,
        /// Hostname of the agent machine
        hostname: String,
        /// Platform string (e.g. "linux", "darwin", "windows")
        platform: String,
        /// Capabilities the agent supports (e.g. "fs-stream")
        capabilities: Vec<String>,
        /// Protocol version. Use `PROTOCOL_VERSION` when sending.
        /// Plain `Option` so bincode always encodes the tag byte.
        version: Option<String>,
    },

    /// Registration acknowledgment
    RegisterAck {
        /// Whether registration was accepted
        accepted: bool,
        /// The stable machine id the agent must echo on reconnect
        machine_id: String,
        /// True when the agent's key no longer matches the accepted
        /// fingerprint; the tunnel stays up but trust-requiring
        /// operations are refused until an operator accepts the key
        quarantined: bool,
        /// Reason if not accepted
        reason: Option<String>,
    },

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Remote operation request
    Request {
        /// The operation to perform
        op: Operation,
    },

    /// Remote operation response
    Response {
        /// Whether the operation succeeded on the agent
        success: bool,
        /// Result data when successful
        payload: Option<ResponsePayload>,
        /// Error description when unsuccessful
        error: Option<String>,
        /// Wall-clock duration on the agent, in milliseconds
        duration_ms: u64,
    },

    /// File transfer chunk
    FileChunk(Bytes),

    /// End of a file transfer
    FileDone {
        /// Total bytes transferred
        size: u64,
    },

    /// Error response
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::Request { .. } => MessageType::Request,
            Message::Response { .. } => MessageType::Response,
            Message::FileChunk(_) => MessageType::FileChunk,
            Message::FileDone { .. } => MessageType::FileDone,
            Message::Error { .. } => MessageType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::Register,
            MessageType::RegisterAck,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::Request,
            MessageType::Response,
            MessageType::FileChunk,
            MessageType::FileDone,
            MessageType::Error,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
    }

    #[test]
    fn test_register_without_version_roundtrips() {
        // First-contact agents may omit the version; the None tag byte
        // must survive the bincode encoding.
        let msg = Message::Register {
            machine_id: None,
            hostname: "host1".to_string(),
            platform: "linux".to_string(),
            capabilities: vec![],
            version: None,
        };

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: Message = bincode::deserialize(&bytes).unwrap();

        match decoded {
            Message::Register {
                machine_id,
                hostname,
                version,
                ..
            } => {
                assert_eq!(machine_id, None);
                assert_eq!(hostname, "host1");
                assert_eq!(version, None);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_exec_operation_serde() {
        let op = Operation::Exec {
            command: "echo hi".to_string(),
            working_dir: Some("/tmp".to_string()),
            env: vec![("LANG".to_string(), "C".to_string())],
            timeout_ms: 5000,
        };

        let bytes = bincode::serialize(&op).unwrap();
        let decoded: Operation = bincode::deserialize(&bytes).unwrap();

        match decoded {
            Operation::Exec {
                command,
                working_dir,
                timeout_ms,
                ..
            } => {
                assert_eq!(command, "echo hi");
                assert_eq!(working_dir.as_deref(), Some("/tmp"));
                assert_eq!(timeout_ms, 5000);
            }
            _ => panic!("Wrong variant"),
        }
    }
}
