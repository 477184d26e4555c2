use crate::{CatalogBackend, CatalogError, DeclareOutcome, RetractOutcome};
use fleetrepo_schema::{validate_name, NodeId, Resource, ResourceId, ResourceKind};
use fleetrepo_store::write_atomic_mode;
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_FILE: &str = ".lock";

/// Catalog kept in a shared directory, one JSON file per identity:
/// `{root}/{kind}/{name}.json`.
///
/// Writes go through a temp file and `rename`, so readers never see a
/// partial entry and `pull` needs no lock. Read-modify-write of an identity
/// (declare, retract) holds an exclusive lock on `{root}/.lock`.
pub struct FileCatalog {
    root: PathBuf,
}

struct CatalogLock {
    file: File,
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, kind: ResourceKind, name: &str) -> Result<PathBuf, CatalogError> {
        validate_name(name).map_err(fleetrepo_schema::ResourceError::from)?;
        Ok(self.root.join(kind.as_str()).join(format!("{name}.json")))
    }

    fn lock(&self) -> Result<CatalogLock, CatalogError> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(CatalogLock { file })
    }

    fn read_entry(path: &Path) -> Result<Option<Resource>, CatalogError> {
        match fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`list`](CatalogBackend::list), but returns per-entry results so
    /// callers can surface corrupt entries instead of skipping them.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(&self) -> Result<Vec<Result<Resource, (PathBuf, CatalogError)>>, CatalogError> {
        // An absent root usually means an unmounted share; reading it as an
        // empty catalog would retract everything on every node.
        if !self.root.is_dir() {
            return Err(CatalogError::Config(format!(
                "catalog directory {} does not exist",
                self.root.display()
            )));
        }
        let mut results = Vec::new();
        for kind in ResourceKind::ALL {
            let dir = self.root.join(kind.as_str());
            if !dir.exists() {
                continue;
            }
            let mut paths = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let is_entry = path.extension().is_some_and(|e| e == "json")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| !n.starts_with('.'));
                if is_entry {
                    paths.push(path);
                }
            }
            paths.sort();
            for path in paths {
                match Self::read_entry(&path) {
                    Ok(Some(r)) if r.kind() == kind => results.push(Ok(r)),
                    Ok(Some(r)) => results.push(Err((
                        path,
                        CatalogError::Config(format!("entry of kind {} filed under {kind}", r.kind())),
                    ))),
                    Ok(None) => {}
                    Err(e) => results.push(Err((path, e))),
                }
            }
        }
        Ok(results)
    }
}

impl CatalogBackend for FileCatalog {
    fn declare(&self, resource: &Resource) -> Result<DeclareOutcome, CatalogError> {
        resource.validate()?;
        let path = self.entry_path(resource.kind(), &resource.name)?;
        let _lock = self.lock()?;

        match Self::read_entry(&path) {
            Ok(Some(existing)) if !resource.supersedes(&existing) => {
                debug!(
                    "stale declaration of {} from {}: {} holds a newer one",
                    resource.id(),
                    resource.declared_by,
                    existing.declared_by
                );
                return Ok(DeclareOutcome::Stale);
            }
            Ok(_) => {}
            Err(e) => warn!("replacing unreadable catalog entry {}: {e}", path.display()),
        }

        let content = serde_json::to_string_pretty(resource)?;
        write_atomic_mode(&path, content.as_bytes(), 0o644)?;
        debug!("declared {} by {}", resource.id(), resource.declared_by);
        Ok(DeclareOutcome::Declared)
    }

    fn retract(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &NodeId,
    ) -> Result<RetractOutcome, CatalogError> {
        let path = self.entry_path(kind, name)?;
        let _lock = self.lock()?;

        let Some(existing) = Self::read_entry(&path)? else {
            return Ok(RetractOutcome::Missing);
        };
        if existing.declared_by != *node {
            return Err(CatalogError::NotOwner {
                id: ResourceId::new(kind, name),
                owner: existing.declared_by,
                node: node.clone(),
            });
        }
        fs::remove_file(&path)?;
        debug!("retracted {kind}/{name} by {node}");
        Ok(RetractOutcome::Retracted)
    }

    fn pull(&self, tags: &BTreeSet<String>) -> Result<Vec<Resource>, CatalogError> {
        Ok(self.list()?.into_iter().filter(|r| r.matches(tags)).collect())
    }

    fn list(&self) -> Result<Vec<Resource>, CatalogError> {
        let mut out = Vec::new();
        for entry in self.list_with_errors()? {
            match entry {
                Ok(r) => out.push(r),
                Err((path, e)) => warn!("skipping corrupt catalog entry {}: {e}", path.display()),
            }
        }
        Ok(out)
    }
}
