//! Broker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the tunnel server binds to
    pub bind_address: String,

    /// Control port for operator tools (localhost only)
    pub control_port: u16,

    /// Heartbeat interval in seconds
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Heartbeat timeout (how long to wait before considering a tunnel dead)
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,

    /// Path to the host key file
    pub host_key_path: PathBuf,

    /// Directory for persisted broker state (machine directory)
    pub state_dir: PathBuf,

    /// Default per-call timeout for remote operations
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,

    /// Ceiling for inline file transfers, in bytes. Larger files must use
    /// the streaming path.
    pub max_inline_file_size: u64,

    /// Global default requests-per-minute limit (warn-only)
    pub default_rate_limit_rpm: u32,

    /// Global default concurrency limit per machine (warn-only)
    pub default_rate_limit_concurrent: u32,

    /// Webhook delivery settings
    pub webhook: WebhookConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            control_port: 22250,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            host_key_path: config_dir.join("host_key"),
            state_dir: config_dir.join("state"),
            default_timeout: Duration::from_secs(30),
            max_inline_file_size: 1024 * 1024,
            default_rate_limit_rpm: 60,
            default_rate_limit_concurrent: 4,
            webhook: WebhookConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Get the control address (localhost:port)
    pub fn control_address(&self) -> String {
        format!("127.0.0.1:{}", self.control_port)
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Global default delivery target. Machines may override; empty means
    /// no delivery unless a machine sets its own URL.
    pub url: Option<String>,

    /// Shared secret for HMAC-SHA256 payload signatures
    pub secret: Option<String>,

    /// Delivery timeout in seconds
    pub timeout_secs: u64,
}

// Helper module for Duration serialization as plain seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
