use crate::CatalogError;
use fleetrepo_schema::{ResourceId, ResourceKind};
use fleetrepo_store::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const STATE_FILE: &str = "applied.json";

/// A hosts-file line owned by one `dns_address` resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsEntry {
    pub ip: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEntry {
    pub kind: ResourceKind,
    pub name: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<HostsEntry>,
}

impl AppliedEntry {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind, self.name.clone())
    }
}

/// What this node last applied, keyed by `kind/name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub entries: BTreeMap<String, AppliedEntry>,
    /// blake3 checksum for integrity verification, set on save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl AppliedState {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE)
    }

    fn compute_checksum(&self) -> Result<String, CatalogError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    /// Load the state file. A missing, unreadable or tampered file yields an
    /// empty state: every pulled resource is then re-applied, which is
    /// idempotent.
    pub fn load(state_dir: &Path) -> Self {
        let path = Self::path(state_dir);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("cannot read {}: {e}; starting from empty state", path.display());
                return Self::default();
            }
        };
        let state: AppliedState = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!("corrupt {}: {e}; starting from empty state", path.display());
                return Self::default();
            }
        };
        if let Some(ref expected) = state.checksum {
            match state.compute_checksum() {
                Ok(actual) if actual == *expected => {}
                _ => {
                    warn!("checksum mismatch in {}; starting from empty state", path.display());
                    return Self::default();
                }
            }
        }
        state
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), CatalogError> {
        let mut record = self.clone();
        record.checksum = Some(record.compute_checksum()?);
        let content = serde_json::to_string_pretty(&record)?;
        write_atomic(&Self::path(state_dir), content.as_bytes())?;
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Option<&AppliedEntry> {
        self.entries.get(&id.to_string())
    }

    pub fn insert(&mut self, entry: AppliedEntry) {
        self.entries.insert(entry.id().to_string(), entry);
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<AppliedEntry> {
        self.entries.remove(&id.to_string())
    }
}
