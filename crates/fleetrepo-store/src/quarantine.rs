use crate::intake::{IntakeCandidate, CHECKSUM_SUFFIX};
use crate::layout::RepoLayout;
use crate::{write_atomic, StoreError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const REASON_SUFFIX: &str = ".reason";

/// A file sitting in a distribution's quarantine area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedFile {
    pub filename: String,
    pub path: PathBuf,
    pub reason: String,
}

/// Rejected intake files, moved aside so they are not retried on every tick.
pub struct Quarantine {
    layout: RepoLayout,
}

impl Quarantine {
    pub fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }

    /// Move `candidate` (and its sidecar, if any) into the quarantine area of
    /// `dist`, replacing an earlier file of the same name, and record why.
    pub fn quarantine(
        &self,
        dist: &str,
        candidate: &IntakeCandidate,
        reason: &str,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.layout.quarantine_dir(dist);
        fs::create_dir_all(&dir)?;

        let dest = dir.join(&candidate.filename);
        move_file(&candidate.path, &dest)?;
        if candidate.sidecar.exists() {
            let sidecar_dest = dir.join(format!("{}{CHECKSUM_SUFFIX}", candidate.filename));
            move_file(&candidate.sidecar, &sidecar_dest)?;
        }
        write_atomic(
            &dir.join(format!("{}{REASON_SUFFIX}", candidate.filename)),
            format!("{reason}\n").as_bytes(),
        )?;

        warn!("quarantined {}/{}: {reason}", dist, candidate.filename);
        Ok(dest)
    }

    pub fn list(&self, dist: &str) -> Result<Vec<QuarantinedFile>, StoreError> {
        let dir = self.layout.quarantine_dir(dist);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(filename) = name.strip_suffix(REASON_SUFFIX) else {
                continue;
            };
            let reason = fs::read_to_string(entry.path())?.trim_end().to_owned();
            files.push(QuarantinedFile {
                filename: filename.to_owned(),
                path: dir.join(filename),
                reason,
            });
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }
}

/// Rename within the same filesystem, falling back to copy + delete when the
/// intake lives on another mount.
fn move_file(from: &Path, to: &Path) -> Result<(), StoreError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}
