//! On-disk storage for fleetrepo repositories.
//!
//! This crate provides the storage layer: `RepoLayout` for the directory
//! structure under `basedir`, a content-addressed `PackagePool` keyed by
//! SHA-256, intake scanning and quarantine, a `SnapshotStore` that publishes
//! compiled snapshots by atomically swapping a symlink, `GarbageCollector`
//! for old snapshots and unreferenced pool entries, and published-tree
//! integrity verification.

pub mod gc;
pub mod intake;
pub mod integrity;
pub mod layout;
pub mod pool;
pub mod quarantine;
pub mod snapshot;

pub use gc::{GarbageCollector, GcReport};
pub use intake::{scan_intake, IntakeCandidate, CHECKSUM_SUFFIX};
pub use integrity::{
    parse_release_checksums, resolve_published, verify_published, verify_snapshot_tree,
    verify_store, IntegrityFailure, IntegrityReport, ReleaseEntry,
};
pub use layout::{RepoLayout, STORE_FORMAT_VERSION};
pub use pool::{sha256_bytes, sha256_file, PackagePool};
pub use quarantine::{Quarantine, QuarantinedFile};
pub use snapshot::{
    RepositorySnapshot, SnapshotBuilder, SnapshotInfo, SnapshotStore, SNAPSHOT_FILE,
};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `dest` via a temp file in the same directory and `rename`.
/// Readers see either the old content or the new one, never a prefix.
///
/// The file is created with mode 0600; use [`write_atomic_mode`] for files
/// other users must read.
pub fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    write_atomic_inner(dest, data, None)
}

/// [`write_atomic`] with explicit Unix permissions, applied before the rename.
pub fn write_atomic_mode(dest: &Path, data: &[u8], mode: u32) -> Result<(), StoreError> {
    write_atomic_inner(dest, data, Some(mode))
}

fn write_atomic_inner(dest: &Path, data: &[u8], mode: Option<u32>) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    if let Some(mode) = mode {
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("package not found in pool: {0}")]
    PackageNotFound(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("'{0}' exists and is not a managed snapshot link")]
    NotALink(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid name: {0}")]
    InvalidName(#[from] fleetrepo_schema::InvalidName),
}
