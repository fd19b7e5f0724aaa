//! Webhook event delivery
//!
//! Lifecycle and audit events go out as signed JSON payloads, one
//! best-effort POST per event on a spawned task. Delivery failure is
//! logged and never propagates to the operation that triggered it; if
//! stronger guarantees are ever needed this is the seam where a durable
//! outbound queue would slot in.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

use tether_core::config::WebhookConfig;
use tether_core::machine::{MachineRecord, MachineSummary};

type HmacSha256 = Hmac<Sha256>;

/// Signature header carrying the hex HMAC of the request body
pub const SIGNATURE_HEADER: &str = "X-Tether-Signature";

/// Lifecycle and audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    /// A machine established a tunnel
    MachineConnected,
    /// A machine's tunnel was lost or closed
    MachineDisconnected,
    /// A machine presented a fingerprint differing from the accepted one
    KeyMismatch,
    /// A command was executed on a machine
    CommandExecuted,
    /// A file was read, written, listed, or transferred
    FileAccessed,
}

impl WebhookEvent {
    /// Stable event name carried in the payload
    pub fn name(&self) -> &'static str {
        match self {
            WebhookEvent::MachineConnected => "machine.connected",
            WebhookEvent::MachineDisconnected => "machine.disconnected",
            WebhookEvent::KeyMismatch => "machine.key_mismatch",
            WebhookEvent::CommandExecuted => "command.executed",
            WebhookEvent::FileAccessed => "file.accessed",
        }
    }
}

/// Signed webhook payload
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    /// Event name (see `WebhookEvent::name`)
    pub event: String,
    /// Emission timestamp, unix millis
    pub timestamp: u64,
    /// Condensed machine view at emission time
    pub machine: MachineSummary,
    /// Event-specific data
    pub data: serde_json::Value,
}

/// Best-effort webhook sender
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    /// Create a dispatcher from delivery configuration
    pub fn new(config: WebhookConfig) -> Self {
        let timeout = if config.timeout_secs == 0 {
            10
        } else {
            config.timeout_secs
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    /// Emit an event for a machine. The per-machine URL override wins
    /// over the global default; with neither set the event is dropped.
    ///
    /// Delivery happens on a spawned task and never blocks the caller.
    pub fn emit(&self, event: WebhookEvent, record: &MachineRecord, data: serde_json::Value) {
        let url = record
            .webhook_url
            .clone()
            .or_else(|| self.config.url.clone());

        let Some(url) = url else {
            return;
        };

        let payload = WebhookPayload {
            event: event.name().to_string(),
            timestamp: tether_core::time::current_time_millis(),
            machine: record.summary(),
            data,
        };

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to serialize webhook payload: {}", e);
                return;
            }
        };

        let signature = self
            .config
            .secret
            .as_deref()
            .map(|secret| sign_payload(secret, &body));

        let client = self.client.clone();
        let machine_id = record.id.clone();
        let event_name = event.name();

        tokio::spawn(async move {
            let mut request = client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body);

            if let Some(sig) = signature {
                request = request.header(SIGNATURE_HEADER, format!("sha256={}", sig));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(
                        "Delivered {} webhook for {} to {}",
                        event_name,
                        machine_id,
                        url
                    );
                }
                Ok(response) => {
                    tracing::warn!(
                        "Webhook {} for {} returned {} (not retried)",
                        event_name,
                        machine_id,
                        response.status()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Webhook {} for {} failed: {} (not retried)",
                        event_name,
                        machine_id,
                        e
                    );
                }
            }
        });
    }
}

/// HMAC-SHA256 over the body, hex encoded. Consumers recompute this with
/// the shared secret to verify authenticity.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
