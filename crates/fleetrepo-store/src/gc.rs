use crate::layout::RepoLayout;
use crate::pool::PackagePool;
use crate::snapshot::SnapshotStore;
use crate::StoreError;
use fleetrepo_schema::{Checksum, SnapshotId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Prunes old snapshots, leftover staging directories and pool entries no
/// kept snapshot references.
pub struct GarbageCollector {
    layout: RepoLayout,
}

#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    /// `dist/snapshot_id` of every snapshot beyond the retention window.
    pub old_snapshots: Vec<String>,
    pub stale_staging: Vec<PathBuf>,
    pub orphaned_packages: Vec<Checksum>,
    pub removed_snapshots: usize,
    pub removed_staging: usize,
    pub removed_packages: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.old_snapshots.is_empty()
            && self.stale_staging.is_empty()
            && self.orphaned_packages.is_empty()
    }
}

impl GarbageCollector {
    pub fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }

    fn distributions(&self) -> Result<Vec<String>, StoreError> {
        let root = self.layout.root().join("snapshots");
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut dists = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dists.push(name.to_owned());
                }
            }
        }
        dists.sort();
        Ok(dists)
    }

    /// Keep the newest `keep` snapshots of every distribution (the live one
    /// always survives) and drop unreferenced pool entries. With `dry_run`
    /// nothing is removed and the report lists what would be.
    ///
    /// The caller must hold the repository lock.
    pub fn collect(&self, keep: usize, dry_run: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(keep, dry_run, || false)
    }

    pub fn collect_with_cancel(
        &self,
        keep: usize,
        dry_run: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let snapshots = SnapshotStore::new(self.layout.clone());
        let pool = PackagePool::new(self.layout.clone());
        let mut report = GcReport::default();

        let mut live_packages: BTreeSet<Checksum> = BTreeSet::new();
        let mut unreadable = false;
        let mut doomed: Vec<(String, SnapshotId, PathBuf)> = Vec::new();

        for dist in self.distributions()? {
            let prunable: BTreeSet<SnapshotId> = snapshots
                .prunable(&dist, keep)?
                .into_iter()
                .map(|i| i.snapshot_id)
                .collect();

            for entry in fs::read_dir(self.layout.snapshots_dir(&dist))? {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                if name.starts_with('.') || !entry.file_type()?.is_dir() {
                    continue;
                }
                let id = SnapshotId::new(name);
                if prunable.contains(&id) {
                    doomed.push((dist.clone(), id, entry.path()));
                    continue;
                }
                match snapshots.load(&dist, &id) {
                    Ok(snap) => live_packages.extend(snap.index.checksums()),
                    Err(e) => {
                        warn!("cannot read snapshot {dist}/{id}: {e}; pool sweep skipped");
                        unreadable = true;
                    }
                }
            }

            report.stale_staging.extend(snapshots.stale_staging_dirs(&dist)?);
        }

        report.old_snapshots = doomed
            .iter()
            .map(|(dist, id, _)| format!("{dist}/{id}"))
            .collect();

        if !unreadable {
            report.orphaned_packages = pool
                .list()?
                .into_iter()
                .filter(|sum| !live_packages.contains(sum))
                .collect();
        }

        if !dry_run {
            for (_, _, path) in &doomed {
                if should_stop() {
                    break;
                }
                fs::remove_dir_all(path)?;
                report.removed_snapshots += 1;
            }
            for path in &report.stale_staging {
                if should_stop() {
                    break;
                }
                fs::remove_dir_all(path)?;
                report.removed_staging += 1;
            }
            for sum in &report.orphaned_packages {
                if should_stop() {
                    break;
                }
                pool.remove(sum)?;
                report.removed_packages += 1;
            }
            if !report.is_empty() {
                info!(
                    "gc removed {} snapshots, {} staging dirs, {} pool entries",
                    report.removed_snapshots, report.removed_staging, report.removed_packages
                );
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RepositorySnapshot;
    use chrono::{TimeZone, Utc};
    use fleetrepo_schema::{package_path, KeyId, PackageFile, PackageIndex};

    fn setup() -> (tempfile::TempDir, RepoLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize(&[]).unwrap();
        (dir, layout)
    }

    fn put(layout: &RepoLayout, data: &[u8]) -> Checksum {
        let src = layout.root().join("src.deb");
        fs::write(&src, data).unwrap();
        PackagePool::new(layout.clone()).put_file(&src).unwrap().0
    }

    fn snapshot_with(layout: &RepoLayout, id: &str, minute: u32, sums: &[&Checksum]) {
        let mut index = PackageIndex::new();
        for (i, sum) in sums.iter().enumerate() {
            let filename = format!("p{i}_1.0_amd64.deb");
            index.insert(
                "main",
                "amd64",
                PackageFile {
                    name: format!("p{i}"),
                    version: "1.0".to_owned(),
                    architecture: "amd64".to_owned(),
                    component: "main".to_owned(),
                    distribution: "stable".to_owned(),
                    path: package_path("stable", "main", "amd64", &filename),
                    size: 1,
                    checksum: (*sum).clone(),
                },
            );
        }
        let snap = RepositorySnapshot {
            distribution: "stable".to_owned(),
            snapshot_id: SnapshotId::new(id),
            generated_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap(),
            key_id: KeyId::new("k"),
            index,
            metadata_signature: String::new(),
            checksum: None,
        };
        let store = SnapshotStore::new(layout.clone());
        store.builder("stable").unwrap().finish(&snap).unwrap();
    }

    #[test]
    fn unreferenced_pool_entries_are_collected() {
        let (_dir, layout) = setup();
        let kept = put(&layout, b"kept");
        let orphan = put(&layout, b"orphan");
        snapshot_with(&layout, "s1", 0, &[&kept]);
        SnapshotStore::new(layout.clone())
            .publish("stable", &SnapshotId::new("s1"))
            .unwrap();

        let report = GarbageCollector::new(layout.clone()).collect(3, false).unwrap();
        assert_eq!(report.orphaned_packages, vec![orphan.clone()]);
        assert_eq!(report.removed_packages, 1);
        let pool = PackagePool::new(layout);
        assert!(pool.exists(&kept));
        assert!(!pool.exists(&orphan));
    }

    #[test]
    fn dry_run_removes_nothing() {
        let (_dir, layout) = setup();
        let orphan = put(&layout, b"orphan");
        snapshot_with(&layout, "s1", 0, &[]);
        snapshot_with(&layout, "s2", 1, &[]);

        let report = GarbageCollector::new(layout.clone()).collect(1, true).unwrap();
        assert_eq!(report.old_snapshots, vec!["stable/s1".to_owned()]);
        assert_eq!(report.orphaned_packages, vec![orphan.clone()]);
        assert_eq!(report.removed_snapshots, 0);
        assert_eq!(report.removed_packages, 0);
        assert!(PackagePool::new(layout.clone()).exists(&orphan));
        assert!(layout.snapshot_path("stable", "s1").exists());
    }

    #[test]
    fn packages_of_pruned_snapshots_become_orphans() {
        let (_dir, layout) = setup();
        let old = put(&layout, b"old");
        let new = put(&layout, b"new");
        snapshot_with(&layout, "s1", 0, &[&old]);
        snapshot_with(&layout, "s2", 1, &[&new]);
        SnapshotStore::new(layout.clone())
            .publish("stable", &SnapshotId::new("s2"))
            .unwrap();

        let report = GarbageCollector::new(layout.clone()).collect(1, false).unwrap();
        assert_eq!(report.removed_snapshots, 1);
        assert_eq!(report.orphaned_packages, vec![old]);
        assert!(!layout.snapshot_path("stable", "s1").exists());
        assert!(layout.snapshot_path("stable", "s2").exists());
    }

    #[test]
    fn stale_staging_dirs_are_removed() {
        let (_dir, layout) = setup();
        let staging = layout.snapshots_dir("stable").join(".staging-1-2");
        fs::create_dir_all(&staging).unwrap();
        let report = GarbageCollector::new(layout).collect(3, false).unwrap();
        assert_eq!(report.removed_staging, 1);
        assert!(!staging.exists());
    }
}
