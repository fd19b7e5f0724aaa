//! Machine directory
//!
//! Holds every machine record the broker has ever seen and persists them
//! as a JSON snapshot so identity and trust state survive restarts.
//! Records are never deleted; decommissioning is a metadata update.
//!
//! Field ownership: the connection manager writes connection state
//! (`online`, `hostname`, `platform`, `last_seen`, `capabilities`), the
//! trust store writes fingerprint fields, and everything else is mutated
//! only through `update`/`configure` here. All writers go through
//! `with_record` so every mutation lands in the snapshot.

use dashmap::DashMap;
use std::path::{Path, PathBuf};

use tether_core::machine::{MachineQuery, MachineRecord, MachineSummary, MachineUpdate};
use tether_core::{DispatchError, MachineId};

/// File name of the persisted snapshot inside the state directory
const STORE_FILE: &str = "machines.json";

/// Directory of all known machines
pub struct Directory {
    /// Records indexed by machine ID
    records: DashMap<MachineId, MachineRecord>,
    /// Snapshot path (None = in-memory only, used by tests)
    store_path: Option<PathBuf>,
}

impl Directory {
    /// Create an in-memory directory with no persistence
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            store_path: None,
        }
    }

    /// Load the directory from a state directory, creating it if needed.
    ///
    /// Every loaded record starts offline: tunnel state is ephemeral and
    /// is rebuilt as agents reconnect.
    pub fn load(state_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let store_path = state_dir.join(STORE_FILE);

        let records = DashMap::new();
        if store_path.exists() {
            let content = std::fs::read_to_string(&store_path)?;
            let loaded: Vec<MachineRecord> = serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            for mut record in loaded {
                record.online = false;
                records.insert(record.id.clone(), record);
            }
        }

        tracing::info!(
            "Loaded {} machine records from {:?}",
            records.len(),
            store_path
        );

        Ok(Self {
            records,
            store_path: Some(store_path),
        })
    }

    /// Get a clone of a machine record
    pub fn get(&self, id: &MachineId) -> Option<MachineRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Check whether an id is known
    pub fn contains(&self, id: &MachineId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of known machines
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the directory is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a newly created record and persist
    pub fn insert(&self, record: MachineRecord) {
        self.records.insert(record.id.clone(), record);
        self.persist();
    }

    /// Mutate a record in place and persist. Returns None for unknown ids.
    ///
    /// This is the single write path for all components; the closure runs
    /// under the shard lock, so it must not block.
    pub fn with_record<R>(
        &self,
        id: &MachineId,
        f: impl FnOnce(&mut MachineRecord) -> R,
    ) -> Option<R> {
        let result = self.records.get_mut(id).map(|mut r| f(&mut r))?;
        self.persist();
        Some(result)
    }

    /// Find machines matching every supplied criterion (logical AND)
    pub fn find(&self, query: &MachineQuery) -> Vec<MachineSummary> {
        let mut results: Vec<MachineSummary> = self
            .records
            .iter()
            .filter(|r| query.matches(r.value()))
            .map(|r| r.summary())
            .collect();
        results.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        results
    }

    /// List every machine
    pub fn list(&self) -> Vec<MachineSummary> {
        self.find(&MachineQuery::default())
    }

    /// Number of machines with a live tunnel
    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|r| r.online).count()
    }

    /// Merge a partial metadata update into a record
    pub fn update(
        &self,
        id: &MachineId,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, DispatchError> {
        self.with_record(id, |record| {
            update.apply(record);
            record.clone()
        })
        .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    /// Apply policy overrides. Empty webhook URL or zero limits clear the
    /// override back to the global default.
    pub fn configure(
        &self,
        id: &MachineId,
        webhook_url: Option<&str>,
        rate_limit_rpm: Option<u32>,
        rate_limit_concurrent: Option<u32>,
    ) -> Result<MachineRecord, DispatchError> {
        self.with_record(id, |record| {
            if let Some(url) = webhook_url {
                record.webhook_url = if url.is_empty() {
                    None
                } else {
                    Some(url.to_string())
                };
            }
            if let Some(rpm) = rate_limit_rpm {
                record.rate_limit_rpm = if rpm == 0 { None } else { Some(rpm) };
            }
            if let Some(concurrent) = rate_limit_concurrent {
                record.rate_limit_concurrent = if concurrent == 0 {
                    None
                } else {
                    Some(concurrent)
                };
            }
            record.clone()
        })
        .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    /// Write the JSON snapshot. Failures are logged, never surfaced to the
    /// mutating operation.
    fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };

        let mut records: Vec<MachineRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        match serde_json::to_string_pretty(&records) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::error!("Failed to persist machine directory to {:?}: {}", path, e);
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize machine directory: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(directory: &Directory, id: &str, tags: &[&str], online: bool) {
        let mut record = MachineRecord::new(MachineId::new(id), format!("{}.local", id), "linux");
        record.tags = tags.iter().map(|t| t.to_string()).collect();
        record.online = online;
        directory.insert(record);
    }

    #[test]
    fn test_find_tag_superset_and_semantics() {
        let directory = Directory::in_memory();
        seed(&directory, "a", &["production", "critical"], true);
        seed(&directory, "b", &["production"], true);

        let query = MachineQuery {
            tags: vec!["production".to_string(), "critical".to_string()],
            ..Default::default()
        };

        let results = directory.find(&query);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id.as_str(), "a");
    }

    #[test]
    fn test_find_online_only() {
        let directory = Directory::in_memory();
        seed(&directory, "a", &[], true);
        seed(&directory, "b", &[], false);

        let query = MachineQuery {
            online_only: true,
            ..Default::default()
        };

        let results = directory.find(&query);
        assert_eq!(results.len(), 1);
        assert!(results[0].online);
    }

    #[test]
    fn test_update_unknown_machine() {
        let directory = Directory::in_memory();
        let result = directory.update(&MachineId::new("nope"), &MachineUpdate::default());
        assert!(matches!(result, Err(DispatchError::NotFound(_))));
    }

    #[test]
    fn test_configure_clears_overrides() {
        let directory = Directory::in_memory();
        seed(&directory, "a", &[], false);
        let id = MachineId::new("a");

        directory
            .configure(&id, Some("https://hooks.example/a"), Some(120), None)
            .unwrap();
        let record = directory.get(&id).unwrap();
        assert_eq!(record.webhook_url.as_deref(), Some("https://hooks.example/a"));
        assert_eq!(record.rate_limit_rpm, Some(120));

        directory.configure(&id, Some(""), Some(0), None).unwrap();
        let record = directory.get(&id).unwrap();
        assert!(record.webhook_url.is_none());
        assert!(record.rate_limit_rpm.is_none());
    }

    #[test]
    fn test_persistence_roundtrip_marks_offline() {
        let dir = tempfile::tempdir().unwrap();

        {
            let directory = Directory::load(dir.path()).unwrap();
            seed(&directory, "a", &["eu"], true);
        }

        let directory = Directory::load(dir.path()).unwrap();
        let record = directory.get(&MachineId::new("a")).unwrap();
        assert!(record.has_tag("eu"));
        // Tunnel state is ephemeral
        assert!(!record.online);
    }
}
