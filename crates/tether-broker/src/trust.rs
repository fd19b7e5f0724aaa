//! Trust-on-first-use identity verification
//!
//! The first fingerprint a machine ever presents is accepted
//! automatically. Any later connect with a different fingerprint sets
//! `key_mismatch` and quarantines the machine: the tunnel stays up and
//! the record stays observable, but trust-requiring operations fail with
//! NotTrusted until an operator explicitly accepts the new key.
//!
//! The accepted fingerprint is derived from the record: it is
//! `current_fingerprint` while trusted and `previous_fingerprint` while
//! a mismatch is pending.

use std::sync::Arc;

use tether_core::types::TrustVerdict;
use tether_core::{DispatchError, MachineId};

use crate::directory::Directory;

/// Verifies and records machine key fingerprints.
///
/// The trust store is the only writer of the fingerprint fields on a
/// machine record.
pub struct TrustStore {
    directory: Arc<Directory>,
}

impl TrustStore {
    /// Create a trust store over the given directory
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    /// Verify an observed fingerprint against the machine's trust state.
    ///
    /// Returns NotFound only for ids that were never registered; callers
    /// create the record before verifying.
    pub fn verify(
        &self,
        id: &MachineId,
        observed: &str,
    ) -> Result<TrustVerdict, DispatchError> {
        let verdict = self.directory.with_record(id, |record| {
            let accepted = if record.key_mismatch {
                record.previous_fingerprint.clone().unwrap_or_default()
            } else {
                record.current_fingerprint.clone()
            };

            if accepted.is_empty() {
                // First contact: accept automatically
                record.current_fingerprint = observed.to_string();
                record.key_mismatch = false;
                TrustVerdict::NewIdentity
            } else if accepted == observed {
                // Also covers a machine reconnecting with its accepted key
                // while a mismatch from an earlier connect is pending
                record.current_fingerprint = observed.to_string();
                record.key_mismatch = false;
                TrustVerdict::Trusted
            } else {
                if !record.key_mismatch {
                    record.previous_fingerprint = Some(record.current_fingerprint.clone());
                }
                record.current_fingerprint = observed.to_string();
                record.key_mismatch = true;
                TrustVerdict::Mismatched
            }
        });

        match verdict {
            Some(v) => {
                if v == TrustVerdict::Mismatched {
                    tracing::warn!("Key mismatch for machine {}: fingerprint changed", id);
                }
                Ok(v)
            }
            None => Err(DispatchError::NotFound(id.to_string())),
        }
    }

    /// Promote the current fingerprint to the trusted one.
    ///
    /// Idempotent: accepting an already-trusted machine is a no-op.
    pub fn accept(&self, id: &MachineId) -> Result<(), DispatchError> {
        self.directory
            .with_record(id, |record| {
                if record.key_mismatch {
                    tracing::info!(
                        "Accepted new key for machine {} ({})",
                        id,
                        record.current_fingerprint
                    );
                    record.key_mismatch = false;
                }
            })
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    /// Whether the machine's current key is trusted
    pub fn is_trusted(&self, id: &MachineId) -> bool {
        self.directory
            .with_record(id, |record| !record.key_mismatch)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::machine::MachineRecord;

    fn store_with(id: &str) -> (Arc<Directory>, TrustStore, MachineId) {
        let directory = Arc::new(Directory::in_memory());
        let id = MachineId::new(id);
        directory.insert(MachineRecord::new(id.clone(), "host", "linux"));
        let trust = TrustStore::new(Arc::clone(&directory));
        (directory, trust, id)
    }

    #[test]
    fn test_first_contact_is_trusted() {
        let (directory, trust, id) = store_with("m1");

        let verdict = trust.verify(&id, "SHA256:aaa").unwrap();
        assert_eq!(verdict, TrustVerdict::NewIdentity);

        let record = directory.get(&id).unwrap();
        assert_eq!(record.current_fingerprint, "SHA256:aaa");
        assert!(!record.key_mismatch);
    }

    #[test]
    fn test_reconnect_with_same_key() {
        let (_, trust, id) = store_with("m1");

        trust.verify(&id, "SHA256:aaa").unwrap();
        let verdict = trust.verify(&id, "SHA256:aaa").unwrap();
        assert_eq!(verdict, TrustVerdict::Trusted);
        assert!(trust.is_trusted(&id));
    }

    #[test]
    fn test_mismatch_retains_both_fingerprints() {
        let (directory, trust, id) = store_with("m1");

        trust.verify(&id, "SHA256:aaa").unwrap();
        let verdict = trust.verify(&id, "SHA256:bbb").unwrap();
        assert_eq!(verdict, TrustVerdict::Mismatched);

        let record = directory.get(&id).unwrap();
        assert!(record.key_mismatch);
        assert_eq!(record.current_fingerprint, "SHA256:bbb");
        assert_eq!(record.previous_fingerprint.as_deref(), Some("SHA256:aaa"));
        assert!(!trust.is_trusted(&id));
    }

    #[test]
    fn test_repeated_mismatch_keeps_accepted_fingerprint() {
        let (directory, trust, id) = store_with("m1");

        trust.verify(&id, "SHA256:aaa").unwrap();
        trust.verify(&id, "SHA256:bbb").unwrap();
        trust.verify(&id, "SHA256:ccc").unwrap();

        // The accepted fingerprint is still the original
        let record = directory.get(&id).unwrap();
        assert_eq!(record.previous_fingerprint.as_deref(), Some("SHA256:aaa"));
        assert_eq!(record.current_fingerprint, "SHA256:ccc");
    }

    #[test]
    fn test_reconnect_with_accepted_key_clears_mismatch() {
        let (_, trust, id) = store_with("m1");

        trust.verify(&id, "SHA256:aaa").unwrap();
        trust.verify(&id, "SHA256:bbb").unwrap();

        let verdict = trust.verify(&id, "SHA256:aaa").unwrap();
        assert_eq!(verdict, TrustVerdict::Trusted);
        assert!(trust.is_trusted(&id));
    }

    #[test]
    fn test_accept_is_idempotent() {
        let (directory, trust, id) = store_with("m1");

        trust.verify(&id, "SHA256:aaa").unwrap();
        trust.verify(&id, "SHA256:bbb").unwrap();

        trust.accept(&id).unwrap();
        assert!(trust.is_trusted(&id));

        // Accepting again is a no-op
        trust.accept(&id).unwrap();
        assert!(trust.is_trusted(&id));

        // The newly accepted key is now the trusted one
        let verdict = trust.verify(&id, "SHA256:bbb").unwrap();
        assert_eq!(verdict, TrustVerdict::Trusted);
    }

    #[test]
    fn test_unknown_machine() {
        let directory = Arc::new(Directory::in_memory());
        let trust = TrustStore::new(directory);

        let result = trust.verify(&MachineId::new("ghost"), "SHA256:aaa");
        assert!(matches!(result, Err(DispatchError::NotFound(_))));
    }
}
