//! Tunnel lifecycle and machine state
//!
//! Per machine the lifecycle is Connecting -> KeyCheck ->
//! {TrustedOnline | MismatchedQuarantined} -> Offline -> Connecting.
//! The manager is the only writer of the pool and of the connection
//! fields on a machine record (`online`, `last_seen`, `hostname`,
//! `platform`, `capabilities`).

use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::machine::MachineRecord;
use tether_core::types::TrustVerdict;
use tether_core::{DispatchError, MachineId};

use crate::connection::{AgentCommand, ConnectionPool, TunnelHandle};
use crate::directory::Directory;
use crate::trust::TrustStore;
use crate::webhook::{WebhookDispatcher, WebhookEvent};

/// Result of registering an inbound tunnel
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// The stable machine id (assigned now if this was first contact)
    pub machine_id: MachineId,
    /// True when the key mismatched and the machine is quarantined
    pub quarantined: bool,
}

/// Owns tunnel lifecycle and online/offline state
pub struct ConnectionManager {
    directory: Arc<Directory>,
    trust: Arc<TrustStore>,
    pool: Arc<ConnectionPool>,
    webhooks: Arc<WebhookDispatcher>,
    /// Process-wide selected machine. A convenience default only: every
    /// dispatch path prefers an explicit identity, and concurrent
    /// multi-machine callers must not rely on this slot.
    selected: RwLock<Option<MachineId>>,
}

impl ConnectionManager {
    /// Create a connection manager over the shared components
    pub fn new(
        directory: Arc<Directory>,
        trust: Arc<TrustStore>,
        pool: Arc<ConnectionPool>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            directory,
            trust,
            pool,
            webhooks,
            selected: RwLock::new(None),
        }
    }

    /// Register an inbound tunnel after its handshake completed.
    ///
    /// Resolves the machine identity (a fresh record on first contact),
    /// runs the key check, marks the machine online, and installs the
    /// tunnel handle. A key mismatch quarantines rather than rejects:
    /// the machine stays observable but trust-requiring operations fail.
    pub fn register(
        &self,
        reported_id: Option<String>,
        hostname: String,
        platform: String,
        capabilities: Vec<String>,
        fingerprint: String,
        command_tx: mpsc::Sender<AgentCommand>,
        cancel: CancellationToken,
    ) -> Result<RegisterOutcome, DispatchError> {
        // Identity resolution: a known reported id keeps its record; an
        // unknown or absent id means first contact
        let machine_id = match reported_id {
            Some(id) if self.directory.contains(&MachineId::new(id.as_str())) => {
                MachineId::new(id)
            }
            _ => {
                let id = MachineId::generate();
                self.directory
                    .insert(MachineRecord::new(id.clone(), hostname.clone(), platform.clone()));
                tracing::info!("First contact from {} assigned machine id {}", hostname, id);
                id
            }
        };

        // Key check
        let verdict = self.trust.verify(&machine_id, &fingerprint)?;
        let quarantined = verdict == TrustVerdict::Mismatched;

        // Connection-owned record fields
        self.directory.with_record(&machine_id, |record| {
            record.hostname = hostname.clone();
            record.platform = platform.clone();
            record.capabilities = capabilities.iter().cloned().collect();
            record.online = true;
            record.last_seen = tether_core::time::current_time_millis();
        });

        // Replace any stale handle for this machine
        let handle = TunnelHandle::new(machine_id.clone(), fingerprint, command_tx, cancel);
        handle.set_quarantined(quarantined);
        if let Some(stale) = self.pool.insert(handle) {
            tracing::warn!("Replacing stale tunnel for {}", machine_id);
            stale.fail_pending();
            stale.disconnect();
        }

        tracing::info!(
            "Machine {} online: {} ({}) [{}]",
            machine_id,
            hostname,
            platform,
            verdict
        );

        if let Some(record) = self.directory.get(&machine_id) {
            self.webhooks.emit(
                WebhookEvent::MachineConnected,
                &record,
                serde_json::json!({ "hostname": hostname, "platform": platform }),
            );
            if quarantined {
                self.webhooks.emit(
                    WebhookEvent::KeyMismatch,
                    &record,
                    serde_json::json!({
                        "currentFingerprint": record.current_fingerprint,
                        "previousFingerprint": record.previous_fingerprint,
                    }),
                );
            }
        }

        Ok(RegisterOutcome {
            machine_id,
            quarantined,
        })
    }

    /// Handle tunnel loss: fail in-flight operations, mark the record
    /// offline, emit the disconnect event. Idempotent.
    pub fn unregister(&self, machine_id: &MachineId) {
        let Some(handle) = self.pool.remove(machine_id) else {
            return;
        };

        handle.fail_pending();
        handle.disconnect();

        self.directory.with_record(machine_id, |record| {
            record.online = false;
            record.last_seen = tether_core::time::current_time_millis();
        });

        tracing::info!("Machine {} offline", machine_id);

        if let Some(record) = self.directory.get(machine_id) {
            self.webhooks
                .emit(WebhookEvent::MachineDisconnected, &record, serde_json::json!({}));
        }
    }

    /// Resolve a target to its live tunnel handle.
    ///
    /// Explicit identity always takes precedence; the selected default is
    /// consulted only when no identity is supplied.
    pub fn resolve(&self, explicit: Option<&MachineId>) -> Result<Arc<TunnelHandle>, DispatchError> {
        let machine_id = match explicit {
            Some(id) => id.clone(),
            None => self
                .selected()
                .ok_or_else(|| {
                    DispatchError::InvalidArgument("no machine selected".to_string())
                })?,
        };

        if !self.directory.contains(&machine_id) {
            return Err(DispatchError::NotFound(machine_id.to_string()));
        }

        self.pool
            .get(&machine_id)
            .ok_or_else(|| DispatchError::Offline(machine_id.to_string()))
    }

    /// Set the process-wide selected machine default
    pub fn select(&self, machine_id: &MachineId) -> Result<(), DispatchError> {
        if !self.directory.contains(machine_id) {
            return Err(DispatchError::NotFound(machine_id.to_string()));
        }
        *self.selected.write().expect("selected lock poisoned") = Some(machine_id.clone());
        Ok(())
    }

    /// Get the selected machine default
    pub fn selected(&self) -> Option<MachineId> {
        self.selected.read().expect("selected lock poisoned").clone()
    }

    /// Clear quarantine on the live handle after a key acceptance
    pub fn clear_quarantine(&self, machine_id: &MachineId) {
        if let Some(handle) = self.pool.get(machine_id) {
            handle.set_quarantined(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::config::WebhookConfig;

    fn manager() -> (Arc<Directory>, Arc<ConnectionPool>, ConnectionManager) {
        let directory = Arc::new(Directory::in_memory());
        let trust = Arc::new(TrustStore::new(Arc::clone(&directory)));
        let pool = Arc::new(ConnectionPool::new());
        let webhooks = Arc::new(WebhookDispatcher::new(WebhookConfig::default()));
        let mgr = ConnectionManager::new(
            Arc::clone(&directory),
            trust,
            Arc::clone(&pool),
            webhooks,
        );
        (directory, pool, mgr)
    }

    fn connect(
        mgr: &ConnectionManager,
        reported_id: Option<String>,
        fingerprint: &str,
    ) -> RegisterOutcome {
        let (tx, _rx) = mpsc::channel(8);
        // Receiver leaks in tests; commands are never consumed
        std::mem::forget(_rx);
        mgr.register(
            reported_id,
            "host1".to_string(),
            "linux".to_string(),
            vec!["fs-stream".to_string()],
            fingerprint.to_string(),
            tx,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_contact_creates_trusted_record() {
        let (directory, pool, mgr) = manager();

        let outcome = connect(&mgr, None, "SHA256:aaa");
        assert!(!outcome.quarantined);

        let record = directory.get(&outcome.machine_id).unwrap();
        assert!(record.online);
        assert!(!record.key_mismatch);
        assert_eq!(record.hostname, "host1");
        assert!(record.capabilities.contains("fs-stream"));
        assert!(pool.get(&outcome.machine_id).is_some());
    }

    #[tokio::test]
    async fn test_reconnect_with_new_key_quarantines() {
        let (directory, pool, mgr) = manager();

        let first = connect(&mgr, None, "SHA256:aaa");
        mgr.unregister(&first.machine_id);

        let second = connect(
            &mgr,
            Some(first.machine_id.to_string()),
            "SHA256:bbb",
        );
        assert_eq!(second.machine_id, first.machine_id);
        assert!(second.quarantined);

        let record = directory.get(&first.machine_id).unwrap();
        assert!(record.key_mismatch);
        // Quarantined machines stay online for observability
        assert!(record.online);
        assert!(pool.get(&first.machine_id).unwrap().is_quarantined());
    }

    #[tokio::test]
    async fn test_unregister_marks_offline() {
        let (directory, pool, mgr) = manager();

        let outcome = connect(&mgr, None, "SHA256:aaa");
        mgr.unregister(&outcome.machine_id);

        assert!(pool.get(&outcome.machine_id).is_none());
        assert!(!directory.get(&outcome.machine_id).unwrap().online);

        // Idempotent
        mgr.unregister(&outcome.machine_id);
    }

    #[tokio::test]
    async fn test_resolve_explicit_beats_selected() {
        let (_, _, mgr) = manager();

        let a = connect(&mgr, None, "SHA256:aaa");
        let b = connect(&mgr, None, "SHA256:bbb");

        mgr.select(&a.machine_id).unwrap();

        let resolved = mgr.resolve(Some(&b.machine_id)).unwrap();
        assert_eq!(resolved.machine_id, b.machine_id);

        let defaulted = mgr.resolve(None).unwrap();
        assert_eq!(defaulted.machine_id, a.machine_id);
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let (_, _, mgr) = manager();

        // Nothing selected
        assert!(matches!(
            mgr.resolve(None),
            Err(DispatchError::InvalidArgument(_))
        ));

        // Unknown identity
        assert!(matches!(
            mgr.resolve(Some(&MachineId::new("ghost"))),
            Err(DispatchError::NotFound(_))
        ));

        // Known but offline
        let outcome = connect(&mgr, None, "SHA256:aaa");
        mgr.unregister(&outcome.machine_id);
        assert!(matches!(
            mgr.resolve(Some(&outcome.machine_id)),
            Err(DispatchError::Offline(_))
        ));
    }
}
