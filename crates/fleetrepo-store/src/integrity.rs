use crate::layout::RepoLayout;
use crate::pool::{sha256_file, PackagePool};
use crate::snapshot::SnapshotStore;
use crate::StoreError;
use fleetrepo_schema::{Checksum, SnapshotId};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
    pub indexes_checked: usize,
    pub indexes_passed: usize,
    pub snapshots_checked: usize,
    pub snapshots_passed: usize,
    /// Filled in by callers that can check Release signatures.
    pub signatures_checked: usize,
    pub signatures_passed: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityFailure {
    pub key: String,
    pub reason: String,
}

/// One entry of a Release `SHA256:` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub checksum: Checksum,
    pub size: u64,
    pub path: String,
}

/// Extract the `SHA256:` list from Release text.
pub fn parse_release_checksums(release: &str) -> Vec<ReleaseEntry> {
    let mut out = Vec::new();
    let mut in_section = false;
    for line in release.lines() {
        if !line.starts_with(' ') {
            in_section = line.trim_end() == "SHA256:";
            continue;
        }
        if !in_section {
            continue;
        }
        let mut fields = line.split_whitespace();
        if let (Some(sum), Some(size), Some(path)) = (fields.next(), fields.next(), fields.next()) {
            if let Ok(size) = size.parse() {
                out.push(ReleaseEntry {
                    checksum: Checksum::new(sum),
                    size,
                    path: path.to_owned(),
                });
            }
        }
    }
    out
}

/// `(Filename, SHA256)` of every stanza in a Packages file.
fn parse_packages(text: &str) -> Vec<(String, Checksum)> {
    let mut out = Vec::new();
    for stanza in text.split("\n\n") {
        let mut filename = None;
        let mut sum = None;
        for line in stanza.lines() {
            if let Some(v) = line.strip_prefix("Filename: ") {
                filename = Some(v.trim().to_owned());
            } else if let Some(v) = line.strip_prefix("SHA256: ") {
                sum = Some(Checksum::new(v.trim()));
            }
        }
        if let (Some(f), Some(s)) = (filename, sum) {
            out.push((f, s));
        }
    }
    out
}

/// Resolve the published link of `dist` to the snapshot directory it points
/// at right now. Readers that open several files should open them all below
/// the returned path, so a concurrent publish cannot hand them two snapshots.
pub fn resolve_published(docroot: &Path, dist: &str) -> Result<PathBuf, StoreError> {
    match fs::canonicalize(docroot.join(dist)) {
        Ok(dir) => Ok(dir),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::SnapshotNotFound(
            format!("{dist} (nothing published)"),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Check the published tree of `dist` under `docroot`: every index listed in
/// `Release` must match its recorded digest and size, and every package the
/// indexes reference must match its `SHA256`. Signatures are not checked here.
pub fn verify_published(docroot: &Path, dist: &str) -> Result<IntegrityReport, StoreError> {
    let snapshot = resolve_published(docroot, dist)?;
    verify_snapshot_tree(&snapshot, dist)
}

/// [`verify_published`] for an already resolved snapshot directory.
/// `Filename` fields are relative to the docroot, so their `{dist}/` prefix
/// maps onto `snapshot`.
pub fn verify_snapshot_tree(snapshot: &Path, dist: &str) -> Result<IntegrityReport, StoreError> {
    let release_path = snapshot.join("Release");
    if !release_path.exists() {
        return Err(StoreError::SnapshotNotFound(format!("{dist} (no Release)")));
    }
    let release = fs::read_to_string(&release_path)?;
    let prefix = format!("{dist}/");
    let mut report = IntegrityReport::default();

    for entry in parse_release_checksums(&release) {
        report.indexes_checked += 1;
        let key = format!("{dist}/{}", entry.path);
        let index_path = snapshot.join(&entry.path);
        let data = match fs::read(&index_path) {
            Ok(d) => d,
            Err(e) => {
                report.failed.push(IntegrityFailure {
                    key,
                    reason: format!("index read error: {e}"),
                });
                continue;
            }
        };
        let actual = crate::pool::sha256_bytes(&data);
        if actual != entry.checksum || data.len() as u64 != entry.size {
            report.failed.push(IntegrityFailure {
                key,
                reason: format!("index digest mismatch: got {actual} ({} bytes)", data.len()),
            });
            continue;
        }
        report.indexes_passed += 1;

        let text = String::from_utf8_lossy(&data);
        for (filename, expected) in parse_packages(&text) {
            report.checked += 1;
            let Some(rel) = filename.strip_prefix(&prefix) else {
                report.failed.push(IntegrityFailure {
                    reason: format!("package path outside '{dist}'"),
                    key: filename,
                });
                continue;
            };
            match sha256_file(&snapshot.join(rel)) {
                Ok((actual, _)) if actual == expected => report.passed += 1,
                Ok((actual, _)) => report.failed.push(IntegrityFailure {
                    key: filename,
                    reason: format!("package hash mismatch: got {actual}"),
                }),
                Err(e) => report.failed.push(IntegrityFailure {
                    key: filename,
                    reason: format!("package read error: {e}"),
                }),
            }
        }
    }

    Ok(report)
}

/// Check every pool entry against its name and every snapshot record of the
/// given distributions against its embedded checksum.
pub fn verify_store(layout: &RepoLayout, dists: &[&str]) -> Result<IntegrityReport, StoreError> {
    let pool = PackagePool::new(layout.clone());
    let snapshots = SnapshotStore::new(layout.clone());
    let mut report = IntegrityReport::default();

    for sum in pool.list()? {
        report.checked += 1;
        match pool.verify(&sum) {
            Ok(()) => report.passed += 1,
            Err(StoreError::IntegrityFailure { actual, .. }) => report.failed.push(IntegrityFailure {
                key: sum.to_string(),
                reason: format!("pool hash mismatch: got {actual}"),
            }),
            Err(e) => report.failed.push(IntegrityFailure {
                key: sum.to_string(),
                reason: format!("pool read error: {e}"),
            }),
        }
    }

    for dist in dists {
        let dir = layout.snapshots_dir(dist);
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            report.snapshots_checked += 1;
            match snapshots.load(dist, &SnapshotId::new(name.as_str())) {
                Ok(_) => report.snapshots_passed += 1,
                Err(e) => report.failed.push(IntegrityFailure {
                    key: format!("{dist}/{name}"),
                    reason: format!("snapshot record: {e}"),
                }),
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::sha256_bytes;

    fn publish_tree(docroot: &Path, deb: &[u8]) {
        let root = docroot.join("stable");
        fs::create_dir_all(root.join("main/amd64")).unwrap();
        fs::write(root.join("main/amd64/hello_1.0_amd64.deb"), deb).unwrap();
        let sum = sha256_bytes(b"hello-deb");
        let packages = format!(
            "Package: hello\nVersion: 1.0\nArchitecture: amd64\nFilename: stable/main/amd64/hello_1.0_amd64.deb\nSize: 9\nSHA256: {sum}\n\n"
        );
        fs::write(root.join("main/amd64/Packages"), &packages).unwrap();
        let release = format!(
            "Origin: o\nSuite: stable\nSHA256:\n {} {} main/amd64/Packages\n",
            sha256_bytes(packages.as_bytes()),
            packages.len()
        );
        fs::write(root.join("Release"), release).unwrap();
    }

    #[test]
    fn parses_release_checksum_section() {
        let release = "Origin: x\nSHA256:\n abc 12 main/amd64/Packages\n def 0 main/arm64/Packages\nOther: y\n";
        let entries = parse_release_checksums(release);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].checksum.as_str(), "abc");
        assert_eq!(entries[0].size, 12);
        assert_eq!(entries[1].path, "main/arm64/Packages");
    }

    #[test]
    fn clean_tree_passes() {
        let dir = tempfile::tempdir().unwrap();
        publish_tree(dir.path(), b"hello-deb");
        let report = verify_published(dir.path(), "stable").unwrap();
        assert_eq!(report.indexes_checked, 1);
        assert_eq!(report.indexes_passed, 1);
        assert_eq!(report.checked, 1);
        assert_eq!(report.passed, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn corrupted_package_detected() {
        let dir = tempfile::tempdir().unwrap();
        publish_tree(dir.path(), b"tampered!");
        let report = verify_published(dir.path(), "stable").unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "stable/main/amd64/hello_1.0_amd64.deb");
    }

    #[test]
    fn corrupted_index_detected() {
        let dir = tempfile::tempdir().unwrap();
        publish_tree(dir.path(), b"hello-deb");
        fs::write(dir.path().join("stable/main/amd64/Packages"), "").unwrap();
        let report = verify_published(dir.path(), "stable").unwrap();
        assert_eq!(report.indexes_passed, 0);
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn missing_release_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_published(dir.path(), "stable"),
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn reads_through_the_link_target_only() {
        let dir = tempfile::tempdir().unwrap();
        let docroot = dir.path().join("public");
        publish_tree(&dir.path().join("snap-a"), b"hello-deb");
        fs::create_dir_all(&docroot).unwrap();
        std::os::unix::fs::symlink(dir.path().join("snap-a/stable"), docroot.join("stable"))
            .unwrap();

        let snapshot = resolve_published(&docroot, "stable").unwrap();
        assert_eq!(snapshot, fs::canonicalize(dir.path().join("snap-a/stable")).unwrap());

        // Repoint the link at a broken tree; the resolved directory still
        // verifies on its own.
        publish_tree(&dir.path().join("snap-b"), b"other bytes");
        fs::remove_file(docroot.join("stable")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("snap-b/stable"), docroot.join("stable"))
            .unwrap();
        assert!(verify_snapshot_tree(&snapshot, "stable").unwrap().is_clean());
        assert!(!verify_published(&docroot, "stable").unwrap().is_clean());
    }

    #[test]
    fn package_outside_the_distribution_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        publish_tree(dir.path(), b"hello-deb");
        let root = dir.path().join("stable");
        let packages = fs::read_to_string(root.join("main/amd64/Packages"))
            .unwrap()
            .replace("Filename: stable/", "Filename: testing/");
        fs::write(root.join("main/amd64/Packages"), &packages).unwrap();
        let release = format!(
            "SHA256:\n {} {} main/amd64/Packages\n",
            sha256_bytes(packages.as_bytes()),
            packages.len()
        );
        fs::write(root.join("Release"), release).unwrap();

        let report = verify_published(dir.path(), "stable").unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("outside"));
    }

    #[test]
    fn verify_store_flags_corrupt_pool_entry() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize(&[]).unwrap();
        let pool = PackagePool::new(layout.clone());
        let src = dir.path().join("x.deb");
        fs::write(&src, b"good").unwrap();
        let (sum, _) = pool.put_file(&src).unwrap();

        assert!(verify_store(&layout, &[]).unwrap().is_clean());

        fs::write(pool.path(&sum), b"bad").unwrap();
        let report = verify_store(&layout, &[]).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, sum.as_str());
    }
}
