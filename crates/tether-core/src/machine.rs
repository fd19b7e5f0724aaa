//! Machine record model
//!
//! One record per remote identity, created on first successful handshake
//! and never deleted, only marked offline. Descriptive metadata, trust
//! state, and connection state live together on the record, but each
//! group has exactly one writer component in the broker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::MachineId;

/// A machine known to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Immutable identity, assigned at first contact
    pub id: MachineId,

    /// Human-readable name (defaults to hostname on first contact)
    #[serde(default)]
    pub display_name: String,

    /// Free-form purpose description ("ci runner", "staging db", ...)
    #[serde(default)]
    pub purpose: String,

    /// Operator-managed tags
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Capabilities observed by the broker at registration
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Hostname observed at the last connect
    #[serde(default)]
    pub hostname: String,

    /// Platform observed at the last connect (e.g. "linux")
    #[serde(default)]
    pub platform: String,

    /// Fingerprint presented on the most recent connect
    #[serde(default)]
    pub current_fingerprint: String,

    /// Fingerprint that was accepted before the current one
    #[serde(default)]
    pub previous_fingerprint: Option<String>,

    /// True while `current_fingerprint` differs from the last accepted one
    #[serde(default)]
    pub key_mismatch: bool,

    /// Ordered path prefixes the machine's files may be accessed under.
    /// Empty means unrestricted.
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Per-machine requests-per-minute override (None = global default)
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Per-machine concurrency override (None = global default)
    #[serde(default)]
    pub rate_limit_concurrent: Option<u32>,

    /// Per-machine webhook target (None = global default)
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Whether a tunnel is currently established
    #[serde(default)]
    pub online: bool,

    /// Last activity timestamp, unix millis
    #[serde(default)]
    pub last_seen: u64,

    /// Record creation timestamp, unix millis
    #[serde(default)]
    pub created_at: u64,
}

impl MachineRecord {
    /// Create a record for a machine seen for the first time
    pub fn new(id: MachineId, hostname: impl Into<String>, platform: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            id,
            display_name: hostname.clone(),
            purpose: String::new(),
            tags: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            hostname,
            platform: platform.into(),
            current_fingerprint: String::new(),
            previous_fingerprint: None,
            key_mismatch: false,
            allowed_paths: Vec::new(),
            rate_limit_rpm: None,
            rate_limit_concurrent: None,
            webhook_url: None,
            online: false,
            last_seen: 0,
            created_at: crate::time::current_time_millis(),
        }
    }

    /// Check whether a remote path is permitted by `allowed_paths`.
    ///
    /// An empty list permits every path; otherwise the path must be
    /// prefixed by one of the entries (deny-by-default).
    pub fn path_permitted(&self, path: &str) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }
        self.allowed_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Check if the machine has a specific tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Condensed view for webhooks and query results
    pub fn summary(&self) -> MachineSummary {
        MachineSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            purpose: self.purpose.clone(),
            tags: self.tags.iter().cloned().collect(),
            online: self.online,
            key_mismatch: self.key_mismatch,
            last_seen: self.last_seen,
        }
    }
}

/// Condensed machine view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSummary {
    /// Unique machine identifier
    pub id: MachineId,
    /// Human-readable name
    pub display_name: String,
    /// Machine hostname
    pub hostname: String,
    /// Platform string
    pub platform: String,
    /// Purpose description
    pub purpose: String,
    /// Tags
    pub tags: Vec<String>,
    /// Whether a tunnel is currently established
    pub online: bool,
    /// Whether the machine's key is awaiting acceptance
    pub key_mismatch: bool,
    /// Last activity timestamp, unix millis
    pub last_seen: u64,
}

/// Criteria for finding machines. All supplied criteria must match
/// (logical AND, never OR).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineQuery {
    /// Substring match over display name, hostname, and purpose
    #[serde(default)]
    pub query: Option<String>,

    /// Exact purpose match
    #[serde(default)]
    pub purpose: Option<String>,

    /// Machine tag set must be a superset of these
    #[serde(default)]
    pub tags: Vec<String>,

    /// Machine capability set must be a superset of these
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Only return machines with a live tunnel
    #[serde(default)]
    pub online_only: bool,
}

impl MachineQuery {
    /// Check whether a record matches every supplied criterion
    pub fn matches(&self, record: &MachineRecord) -> bool {
        if self.online_only && !record.online {
            return false;
        }

        if let Some(q) = &self.query {
            let q = q.to_lowercase();
            let hit = record.display_name.to_lowercase().contains(&q)
                || record.hostname.to_lowercase().contains(&q)
                || record.purpose.to_lowercase().contains(&q);
            if !hit {
                return false;
            }
        }

        if let Some(purpose) = &self.purpose {
            if &record.purpose != purpose {
                return false;
            }
        }

        if !self.tags.iter().all(|t| record.tags.contains(t)) {
            return false;
        }

        if !self
            .capabilities
            .iter()
            .all(|c| record.capabilities.contains(c))
        {
            return false;
        }

        true
    }
}

/// Partial metadata update. Only supplied fields are applied; `tags` and
/// `capabilities` replace the existing sets wholesale so callers can
/// deterministically clear entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineUpdate {
    /// New display name
    #[serde(default)]
    pub display_name: Option<String>,

    /// New purpose description
    #[serde(default)]
    pub purpose: Option<String>,

    /// Replacement tag set
    #[serde(default)]
    pub tags: Option<Vec<String>>,

    /// Replacement capability set
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,

    /// Replacement allowed-path list
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
}

impl MachineUpdate {
    /// Apply this update to a record, leaving omitted fields untouched
    pub fn apply(&self, record: &mut MachineRecord) {
        if let Some(name) = &self.display_name {
            record.display_name = name.clone();
        }
        if let Some(purpose) = &self.purpose {
            record.purpose = purpose.clone();
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.iter().cloned().collect();
        }
        if let Some(caps) = &self.capabilities {
            record.capabilities = caps.iter().cloned().collect();
        }
        if let Some(paths) = &self.allowed_paths {
            record.allowed_paths = paths.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_tags(tags: &[&str]) -> MachineRecord {
        let mut record = MachineRecord::new(MachineId::new("m1"), "host1", "linux");
        record.tags = tags.iter().map(|t| t.to_string()).collect();
        record
    }

    #[test]
    fn test_empty_allowed_paths_permits_all() {
        let record = MachineRecord::new(MachineId::new("m1"), "host1", "linux");
        assert!(record.path_permitted("/etc/passwd"));
        assert!(record.path_permitted("/anything/at/all"));
    }

    #[test]
    fn test_allowed_paths_deny_by_default() {
        let mut record = MachineRecord::new(MachineId::new("m1"), "host1", "linux");
        record.allowed_paths = vec!["/opt/app".to_string()];

        assert!(record.path_permitted("/opt/app/data.txt"));
        assert!(!record.path_permitted("/etc/passwd"));
    }

    #[test]
    fn test_query_tag_superset() {
        let query = MachineQuery {
            tags: vec!["production".to_string(), "critical".to_string()],
            ..Default::default()
        };

        assert!(query.matches(&record_with_tags(&["production", "critical", "eu"])));
        assert!(!query.matches(&record_with_tags(&["production"])));
    }

    #[test]
    fn test_query_criteria_are_anded() {
        let mut record = record_with_tags(&["production"]);
        record.purpose = "ci runner".to_string();

        let query = MachineQuery {
            tags: vec!["production".to_string()],
            online_only: true,
            ..Default::default()
        };
        // Tag matches, but the record is offline
        assert!(!query.matches(&record));

        record.online = true;
        assert!(query.matches(&record));
    }

    #[test]
    fn test_query_substring_match() {
        let mut record = record_with_tags(&[]);
        record.purpose = "staging database".to_string();

        let query = MachineQuery {
            query: Some("Staging".to_string()),
            ..Default::default()
        };
        assert!(query.matches(&record));
    }

    #[test]
    fn test_update_replaces_tags_wholesale() {
        let mut record = record_with_tags(&["old", "tags"]);

        let update = MachineUpdate {
            tags: Some(vec!["fresh".to_string()]),
            ..Default::default()
        };
        update.apply(&mut record);

        assert!(record.has_tag("fresh"));
        assert!(!record.has_tag("old"));
        // Omitted fields are untouched
        assert_eq!(record.hostname, "host1");
    }
}
