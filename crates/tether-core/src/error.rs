//! Core error types for Tether

use std::path::PathBuf;
use tether_protocol::ProtocolError;
use thiserror::Error;

/// Top-level error type for the Tether ecosystem
#[derive(Error, Debug)]
pub enum TetherError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by remote operations.
///
/// Every failure mode a caller can observe maps to exactly one of these;
/// rate-limit threshold breaches are deliberately absent (warn-only mode
/// records them but never fails a call).
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Unknown machine identity
    #[error("Machine not found: {0}")]
    NotFound(String),

    /// No live tunnel for the machine
    #[error("Machine offline: {0}")]
    Offline(String),

    /// The tunnel dropped while the operation was in flight
    #[error("Machine unreachable: {0}")]
    Unreachable(String),

    /// The machine's key fingerprint changed and has not been accepted
    #[error("Machine not trusted: {0} (key mismatch pending acceptance)")]
    NotTrusted(String),

    /// No response within the deadline
    #[error("Operation timed out after {timeout_ms}ms on {machine}")]
    Timeout { machine: String, timeout_ms: u64 },

    /// Path outside the machine's allowed prefixes
    #[error("Path not authorized: {path}")]
    Unauthorized { path: String },

    /// Inline transfer over the configured ceiling
    #[error("Size {size} exceeds inline limit of {max} bytes; use streaming transfer")]
    SizeExceeded { size: u64, max: u64 },

    /// Malformed or unsupported request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The agent reported a failure executing the operation
    #[error("Remote error: {0}")]
    Remote(String),
}

impl DispatchError {
    /// Stable string code for the control surface
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Offline(_) => "offline",
            DispatchError::Unreachable(_) => "unreachable",
            DispatchError::NotTrusted(_) => "not_trusted",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Unauthorized { .. } => "unauthorized",
            DispatchError::SizeExceeded { .. } => "size_exceeded",
            DispatchError::InvalidArgument(_) => "invalid_argument",
            DispatchError::Remote(_) => "remote_error",
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(DispatchError::NotFound("m".into()).code(), "not_found");
        assert_eq!(
            DispatchError::Unauthorized {
                path: "/etc".into()
            }
            .code(),
            "unauthorized"
        );
        assert_eq!(
            DispatchError::Timeout {
                machine: "m".into(),
                timeout_ms: 5000
            }
            .code(),
            "timeout"
        );
    }
}
