//! Control surface for driving the broker
//!
//! Uses JSON-encoded messages over TCP on localhost (127.0.0.1), one
//! message per line. TCP is used instead of Unix sockets for
//! cross-platform compatibility.
//!
//! Every machine-targeted request carries `machine: Option<String>`:
//! an explicit identity, or None to use the process-wide selected
//! default. Concurrent multi-machine callers must always pass the
//! explicit identity.

use serde::{Deserialize, Serialize};

use crate::machine::{MachineQuery, MachineRecord, MachineSummary, MachineUpdate};
use tether_protocol::{FileEntry, MetricsReport};

/// Control request from an operator tool to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Execute a command on a machine
    Run {
        machine: Option<String>,
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        /// Per-call timeout in milliseconds (None = broker default)
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Read a file inline (bounded; use TransferFile beyond the ceiling)
    ReadFile {
        machine: Option<String>,
        path: String,
        #[serde(default)]
        size_limit: Option<u64>,
    },

    /// Write a file inline
    WriteFile {
        machine: Option<String>,
        path: String,
        content: Vec<u8>,
    },

    /// Streaming file transfer between the broker host and the machine
    TransferFile {
        machine: Option<String>,
        direction: TransferDirection,
        /// Path on the broker host
        local_path: String,
        /// Path on the machine
        remote_path: String,
    },

    /// List directory entries on a machine
    ListFiles {
        machine: Option<String>,
        path: String,
    },

    /// Fetch a health snapshot
    Metrics {
        machine: Option<String>,
        #[serde(default)]
        summary: bool,
    },

    /// Get the full record for a machine
    Describe { machine: Option<String> },

    /// Find machines matching all supplied criteria
    Find {
        #[serde(default)]
        query: MachineQuery,
    },

    /// Merge a partial metadata update into a machine record
    Update {
        machine: Option<String>,
        update: MachineUpdate,
    },

    /// Set per-machine policy overrides. Only supplied fields are
    /// applied; an empty webhook URL or a zero limit clears the
    /// override back to the global default.
    Configure {
        machine: Option<String>,
        #[serde(default)]
        webhook_url: Option<String>,
        #[serde(default)]
        rate_limit_rpm: Option<u32>,
        #[serde(default)]
        rate_limit_concurrent: Option<u32>,
    },

    /// Set the process-wide selected machine default
    Select { machine: String },

    /// Accept a machine's changed key fingerprint
    AcceptKey { machine: Option<String> },

    /// Get rate-limiter statistics for a machine
    RateStats { machine: Option<String> },

    /// Get broker status
    Status,

    /// Ping (for keepalive)
    Ping,

    /// Shut the broker down
    Shutdown,
}

/// Direction of a streaming transfer, from the broker host's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Broker host -> machine
    Upload,
    /// Machine -> broker host
    Download,
}

/// Control response from the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Command execution result
    Command(CommandResult),

    /// Inline file content
    FileData { content: Vec<u8> },

    /// Streaming transfer finished
    Transferred { bytes: u64 },

    /// Directory listing
    Files { entries: Vec<FileEntry> },

    /// Health snapshot (opaque to the broker)
    Metrics(MetricsReport),

    /// Full machine record
    Machine(Box<MachineRecord>),

    /// Query results
    Machines { machines: Vec<MachineSummary> },

    /// Rate-limiter statistics
    RateStats(RateStats),

    /// Broker status
    Status(BrokerStatus),

    /// Generic success
    Ok,

    /// Structured error (see `DispatchError::code` for the code set)
    Error { code: String, message: String },

    /// Pong response
    Pong,
}

/// Structured result of a remote command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Process exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    /// Round-trip duration observed by the broker, in milliseconds
    pub duration_ms: u64,
}

/// Rate-limiter statistics for one machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStats {
    /// Requests within the trailing 60-second window
    pub rpm_current: u32,
    /// Operations currently in flight
    pub concurrent_current: u32,
    /// Effective requests-per-minute limit
    pub rpm_limit: u32,
    /// Effective concurrency limit
    pub concurrent_limit: u32,
    /// Cumulative count of rpm threshold breaches
    pub rpm_warnings: u64,
    /// Cumulative count of concurrency threshold breaches
    pub concurrent_warnings: u64,
}

/// Broker status information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// Whether the broker is accepting tunnels
    pub running: bool,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Total machines in the directory
    pub machine_count: usize,
    /// Machines with a live tunnel
    pub online_count: usize,
    /// Broker version
    pub version: String,
    /// Tunnel bind address
    pub bind_address: String,
}
