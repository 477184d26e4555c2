use crate::layout::RepoLayout;
use crate::{fsync_dir, write_atomic_mode, StoreError};
use chrono::{DateTime, Utc};
use fleetrepo_schema::{validate_name, KeyId, PackageIndex, SnapshotId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Name of the serialized snapshot record inside every snapshot directory.
pub const SNAPSHOT_FILE: &str = "snapshot.json";
const STAGING_PREFIX: &str = ".staging-";

/// The compiled, signed state of one distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositorySnapshot {
    pub distribution: String,
    pub snapshot_id: SnapshotId,
    /// Time the index last changed; rendered as the Release `Date`.
    pub generated_at: DateTime<Utc>,
    pub key_id: KeyId,
    pub index: PackageIndex,
    /// Base64 detached signature over the Release file.
    pub metadata_signature: String,
    /// blake3 checksum for integrity verification, set on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl RepositorySnapshot {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    fn load(path: &Path) -> Result<Self, StoreError> {
        let content = fs::read_to_string(path)?;
        let snap: RepositorySnapshot = serde_json::from_str(&content)?;
        if let Some(ref expected) = snap.checksum {
            let actual = snap.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    key: path.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(snap)
    }
}

/// Summary of one snapshot directory, as shown by `status` and used for pruning.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub snapshot_id: SnapshotId,
    pub path: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub package_count: usize,
    pub live: bool,
}

/// A snapshot directory under construction.
///
/// Everything is written into a hidden staging directory next to the final
/// snapshots. [`finish`](Self::finish) renames it into place; dropping an
/// unfinished builder removes the staging directory, so an aborted compile
/// leaves nothing behind.
pub struct SnapshotBuilder {
    staging: PathBuf,
    snapshots_dir: PathBuf,
    finished: bool,
}

impl SnapshotBuilder {
    fn new(snapshots_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&snapshots_dir)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let staging = snapshots_dir.join(format!("{STAGING_PREFIX}{}-{nanos}", std::process::id()));
        fs::create_dir(&staging)?;
        Ok(Self {
            staging,
            snapshots_dir,
            finished: false,
        })
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Write a file at `rel` (e.g. `main/amd64/Packages`) inside the snapshot.
    pub fn write_file(&self, rel: &str, data: &[u8]) -> Result<(), StoreError> {
        write_atomic_mode(&self.staging.join(rel), data, 0o644)
    }

    /// Place a pool file at `rel`. Hard-linked when possible so snapshots
    /// share storage with the pool, copied otherwise.
    pub fn link_package(&self, pool_path: &Path, rel: &str) -> Result<(), StoreError> {
        let dest = self.staging.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            return Ok(());
        }
        if let Err(e) = fs::hard_link(pool_path, &dest) {
            debug!("hard link of {} failed ({e}), copying", pool_path.display());
            fs::copy(pool_path, &dest)?;
        }
        Ok(())
    }

    /// Write `snapshot.json` and move the staging directory to
    /// `snapshots/{dist}/{snapshot_id}`. If that directory already exists it
    /// holds identical content (the id is derived from the signed metadata)
    /// and is reused.
    pub fn finish(mut self, snapshot: &RepositorySnapshot) -> Result<PathBuf, StoreError> {
        validate_name(&snapshot.snapshot_id)?;
        let mut record = snapshot.clone();
        record.checksum = Some(record.compute_checksum()?);
        let content = serde_json::to_string_pretty(&record)?;
        write_atomic_mode(&self.staging.join(SNAPSHOT_FILE), content.as_bytes(), 0o644)?;

        let dest = self.snapshots_dir.join(snapshot.snapshot_id.as_str());
        if dest.exists() {
            debug!("snapshot {} already exists, reusing", snapshot.snapshot_id);
            fs::remove_dir_all(&self.staging)?;
        } else {
            fs::rename(&self.staging, &dest)?;
            fsync_dir(&self.snapshots_dir)?;
        }
        self.finished = true;
        Ok(dest)
    }
}

impl Drop for SnapshotBuilder {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                warn!("failed to clean staging dir {}: {e}", self.staging.display());
            }
        }
    }
}

/// Snapshot directories plus the symlinks that publish them.
pub struct SnapshotStore {
    layout: RepoLayout,
}

impl SnapshotStore {
    pub fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }

    pub fn builder(&self, dist: &str) -> Result<SnapshotBuilder, StoreError> {
        validate_name(dist)?;
        SnapshotBuilder::new(self.layout.snapshots_dir(dist))
    }

    /// Atomically point `{docroot}/{dist}` at snapshot `id`.
    ///
    /// A fresh symlink is created under a temporary name and renamed over the
    /// old one, so readers resolve either the previous snapshot or the new
    /// one and never a missing path.
    pub fn publish(&self, dist: &str, id: &SnapshotId) -> Result<(), StoreError> {
        validate_name(dist)?;
        let target_dir = self.layout.snapshot_path(dist, id);
        if !target_dir.join(SNAPSHOT_FILE).exists() {
            return Err(StoreError::SnapshotNotFound(format!("{dist}/{id}")));
        }

        let docroot = self.layout.docroot();
        fs::create_dir_all(&docroot)?;
        let link = self.layout.published_link(dist);
        if let Ok(meta) = fs::symlink_metadata(&link) {
            if !meta.file_type().is_symlink() {
                return Err(StoreError::NotALink(link.display().to_string()));
            }
        }

        let relative = Path::new("..").join("snapshots").join(dist).join(id.as_str());
        let tmp_link = docroot.join(format!(".{dist}.{}.tmp", std::process::id()));
        let _ = fs::remove_file(&tmp_link);
        std::os::unix::fs::symlink(&relative, &tmp_link)?;
        if let Err(e) = fs::rename(&tmp_link, &link) {
            let _ = fs::remove_file(&tmp_link);
            return Err(e.into());
        }
        fsync_dir(&docroot)?;
        info!("published {dist} -> {id}");
        Ok(())
    }

    /// Id of the snapshot the publisher currently serves for `dist`.
    pub fn current_id(&self, dist: &str) -> Result<Option<SnapshotId>, StoreError> {
        let link = self.layout.published_link(dist);
        match fs::read_link(&link) {
            Ok(target) => Ok(target
                .file_name()
                .and_then(|n| n.to_str())
                .map(SnapshotId::new)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(StoreError::NotALink(link.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The live snapshot for `dist`, `None` before the first publication.
    pub fn current(&self, dist: &str) -> Result<Option<RepositorySnapshot>, StoreError> {
        match self.current_id(dist)? {
            Some(id) => self.load(dist, &id).map(Some),
            None => Ok(None),
        }
    }

    pub fn load(&self, dist: &str, id: &SnapshotId) -> Result<RepositorySnapshot, StoreError> {
        let path = self.layout.snapshot_path(dist, id).join(SNAPSHOT_FILE);
        if !path.exists() {
            return Err(StoreError::SnapshotNotFound(format!("{dist}/{id}")));
        }
        RepositorySnapshot::load(&path)
    }

    /// All snapshots of `dist`, newest first. Unreadable snapshot directories
    /// are skipped with a warning.
    pub fn list(&self, dist: &str) -> Result<Vec<SnapshotInfo>, StoreError> {
        let dir = self.layout.snapshots_dir(dist);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let live = self.current_id(dist).unwrap_or_default();
        let mut infos = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            let id = SnapshotId::new(name);
            match self.load(dist, &id) {
                Ok(snap) => infos.push(SnapshotInfo {
                    live: live.as_ref() == Some(&id),
                    snapshot_id: id,
                    path: entry.path(),
                    generated_at: snap.generated_at,
                    package_count: snap.index.package_count(),
                }),
                Err(e) => warn!("skipping unreadable snapshot {dist}/{id}: {e}"),
            }
        }
        infos.sort_by(|a, b| {
            b.generated_at
                .cmp(&a.generated_at)
                .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
        });
        Ok(infos)
    }

    /// Snapshots that [`prune`](Self::prune) would remove: everything beyond
    /// the newest `keep`, never the live one.
    pub fn prunable(&self, dist: &str, keep: usize) -> Result<Vec<SnapshotInfo>, StoreError> {
        let keep = keep.max(1);
        Ok(self
            .list(dist)?
            .into_iter()
            .enumerate()
            .filter(|(i, info)| *i >= keep && !info.live)
            .map(|(_, info)| info)
            .collect())
    }

    pub fn prune(&self, dist: &str, keep: usize) -> Result<Vec<SnapshotId>, StoreError> {
        let mut removed = Vec::new();
        for info in self.prunable(dist, keep)? {
            fs::remove_dir_all(&info.path)?;
            debug!("pruned snapshot {dist}/{}", info.snapshot_id);
            removed.push(info.snapshot_id);
        }
        Ok(removed)
    }

    /// Leftover staging directories from interrupted compiles.
    pub fn stale_staging_dirs(&self, dist: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.layout.snapshots_dir(dist);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(STAGING_PREFIX))
            {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}
