//! Per-node catalog compiler: converge local apt sources and hosts entries
//! to the set of resources pulled for this node's tags.

use crate::apt;
use crate::hosts::apply_hosts;
use crate::state::{AppliedEntry, AppliedState, HostsEntry};
use crate::{CatalogBackend, CatalogError};
use fleetrepo_schema::{
    FleetNode, NodeSection, Resource, ResourceId, ResourceKind, ResourcePayload,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a node's applied configuration lives.
#[derive(Debug, Clone)]
pub struct NodePaths {
    pub sources_dir: PathBuf,
    pub keyring_dir: PathBuf,
    pub hosts_file: PathBuf,
    pub state_dir: PathBuf,
}

impl From<&NodeSection> for NodePaths {
    fn from(node: &NodeSection) -> Self {
        Self {
            sources_dir: node.sources_dir.clone(),
            keyring_dir: node.keyring_dir.clone(),
            hosts_file: node.hosts_file.clone(),
            state_dir: node.state_dir.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub applied: Vec<ResourceId>,
    pub unchanged: Vec<ResourceId>,
    pub removed: Vec<ResourceId>,
    pub failed: Vec<(ResourceId, String)>,
    pub hosts_changed: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn changed(&self) -> bool {
        !self.applied.is_empty() || !self.removed.is_empty() || self.hosts_changed
    }
}

enum Outcome {
    Changed(AppliedEntry),
    Unchanged,
}

pub struct CatalogCompiler<'a> {
    backend: &'a dyn CatalogBackend,
    paths: NodePaths,
    fetch_timeout: Duration,
}

impl<'a> CatalogCompiler<'a> {
    pub fn new(backend: &'a dyn CatalogBackend, paths: NodePaths) -> Self {
        Self {
            backend,
            paths,
            fetch_timeout: crate::DEFAULT_TIMEOUT,
        }
    }

    /// Bound on each signing-key download.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Pull for `node`'s tags and make local state match.
    ///
    /// A failed pull aborts before anything is touched. A resource that
    /// fails to apply is reported in `failed` and keeps whatever was applied
    /// for it before.
    pub fn reconcile(&self, node: &FleetNode) -> Result<ReconcileReport, CatalogError> {
        let pulled = self.backend.pull(&node.tags)?;
        debug!("pulled {} resources for {}", pulled.len(), node.node_id);

        let mut wanted: BTreeMap<ResourceId, Resource> = BTreeMap::new();
        for resource in pulled {
            if !node.wants(&resource) {
                continue;
            }
            let id = resource.id();
            match wanted.get(&id) {
                Some(existing) if !resource.supersedes(existing) => {}
                _ => {
                    wanted.insert(id, resource);
                }
            }
        }

        let previous = AppliedState::load(&self.paths.state_dir);
        let mut state = previous.clone();
        let mut report = ReconcileReport::default();

        for (id, resource) in &wanted {
            match self.apply(resource, previous.get(id)) {
                Ok(Outcome::Changed(entry)) => {
                    info!("applied {id}");
                    state.insert(entry);
                    report.applied.push(id.clone());
                }
                Ok(Outcome::Unchanged) => report.unchanged.push(id.clone()),
                Err(e) => {
                    warn!("failed to apply {id}: {e}");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        for entry in previous.entries.values() {
            let id = entry.id();
            if wanted.contains_key(&id) {
                continue;
            }
            match self.remove(&id) {
                Ok(()) => {
                    info!("removed {id}");
                    state.remove(&id);
                    report.removed.push(id);
                }
                Err(e) => {
                    warn!("failed to remove {id}: {e}");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        // Source lists left behind by a lost or reset state file.
        for name in apt::managed_source_names(&self.paths.sources_dir)? {
            let id = ResourceId::new(ResourceKind::RepositorySource, name);
            if wanted.contains_key(&id) || state.get(&id).is_some() || report.removed.contains(&id) {
                continue;
            }
            match self.remove(&id) {
                Ok(()) => {
                    info!("removed orphaned {id}");
                    report.removed.push(id);
                }
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }

        state.save(&self.paths.state_dir)?;

        let hosts: Vec<HostsEntry> = state
            .entries
            .values()
            .filter_map(|e| e.hosts.clone())
            .collect();
        report.hosts_changed = apply_hosts(&self.paths.hosts_file, &hosts)?;
        if report.hosts_changed {
            info!("updated {}", self.paths.hosts_file.display());
        }

        Ok(report)
    }

    fn apply(&self, resource: &Resource, previous: Option<&AppliedEntry>) -> Result<Outcome, CatalogError> {
        resource.validate()?;
        let fingerprint = resource.fingerprint();
        let same = previous.is_some_and(|p| p.fingerprint == fingerprint);

        match &resource.payload {
            ResourcePayload::RepositorySource(src) => {
                let list = apt::source_list_path(&self.paths.sources_dir, &resource.name);
                let key = apt::key_path(&self.paths.keyring_dir, &resource.name);
                let rendered = apt::render_source_list(&resource.name, src, &key);

                let list_current = fs::read_to_string(&list).is_ok_and(|c| c == rendered);
                if same && key.exists() && list_current {
                    return Ok(Outcome::Unchanged);
                }
                // The key goes first so apt never sees a list whose key is missing.
                if !same || !key.exists() {
                    let material = apt::fetch_key(&src.key_source_url, self.fetch_timeout)?;
                    apt::write_if_changed(&key, &material)?;
                }
                apt::write_if_changed(&list, rendered.as_bytes())?;
                Ok(Outcome::Changed(AppliedEntry {
                    kind: resource.kind(),
                    name: resource.name.clone(),
                    fingerprint,
                    hosts: None,
                }))
            }
            ResourcePayload::DnsAddress(addr) => {
                if same {
                    return Ok(Outcome::Unchanged);
                }
                Ok(Outcome::Changed(AppliedEntry {
                    kind: resource.kind(),
                    name: resource.name.clone(),
                    fingerprint,
                    hosts: Some(HostsEntry {
                        ip: addr.ip.clone(),
                        hostname: addr.hostname.clone(),
                    }),
                }))
            }
        }
    }

    fn remove(&self, id: &ResourceId) -> Result<(), CatalogError> {
        match id.kind {
            ResourceKind::RepositorySource => {
                fleetrepo_schema::validate_name(&id.name)
                    .map_err(fleetrepo_schema::ResourceError::from)?;
                apt::remove_managed(&apt::source_list_path(&self.paths.sources_dir, &id.name))?;
                apt::remove_managed(&apt::key_path(&self.paths.keyring_dir, &id.name))?;
            }
            // Hosts lines are re-rendered from state after removal.
            ResourceKind::DnsAddress => {}
        }
        Ok(())
    }
}
