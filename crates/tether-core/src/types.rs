//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a machine.
///
/// Assigned by the broker at first contact and immutable for the life of
/// the record. An agent echoes this id on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(pub String);

impl MachineId {
    /// Create a machine ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh globally unique machine ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of a trust-store fingerprint check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    /// Fingerprint matches the last accepted one
    Trusted,
    /// Fingerprint differs from the accepted one; machine is quarantined
    Mismatched,
    /// First contact; fingerprint stored and trusted
    NewIdentity,
}

impl fmt::Display for TrustVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustVerdict::Trusted => write!(f, "trusted"),
            TrustVerdict::Mismatched => write!(f, "mismatched"),
            TrustVerdict::NewIdentity => write!(f, "new-identity"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = MachineId::generate();
        let b = MachineId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_trust_verdict_display() {
        assert_eq!(format!("{}", TrustVerdict::Trusted), "trusted");
        assert_eq!(format!("{}", TrustVerdict::Mismatched), "mismatched");
    }
}
