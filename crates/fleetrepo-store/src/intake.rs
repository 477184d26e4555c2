use crate::StoreError;
use fleetrepo_schema::{package::PACKAGE_EXTENSIONS, Checksum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of the sidecar file that carries a package's expected SHA-256.
pub const CHECKSUM_SUFFIX: &str = ".sha256";
const IGNORED_SUFFIXES: &[&str] = &[".part", ".tmp", CHECKSUM_SUFFIX, ".reason"];

/// One file found in a distribution's intake directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeCandidate {
    pub path: PathBuf,
    pub filename: String,
    /// Component subdirectory the file was dropped into, `None` for the
    /// intake root.
    pub component: Option<String>,
    pub sidecar: PathBuf,
    /// Content of the sidecar, lowercased. `None` when the sidecar is missing
    /// or empty.
    pub expected_checksum: Option<Checksum>,
}

impl IntakeCandidate {
    fn load(path: PathBuf, component: Option<String>) -> Result<Self, StoreError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let sidecar = path.with_file_name(format!("{filename}{CHECKSUM_SUFFIX}"));
        let expected_checksum = match fs::read_to_string(&sidecar) {
            Ok(content) => content
                .split_whitespace()
                .next()
                .map(|tok| Checksum::new(tok.to_ascii_lowercase())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            filename,
            component,
            sidecar,
            expected_checksum,
        })
    }

    /// Whether the file looks like a binary package at all. Other files in
    /// intake are still candidates so they end up quarantined, not ignored.
    pub fn has_package_extension(&self) -> bool {
        PACKAGE_EXTENSIONS
            .iter()
            .any(|ext| self.filename.ends_with(&format!(".{ext}")))
    }

    /// Delete the file and its sidecar after successful incorporation.
    pub fn remove(&self) -> Result<(), StoreError> {
        for p in [&self.path, &self.sidecar] {
            match fs::remove_file(p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn regular_files(dir: &Path) -> Result<Vec<(String, PathBuf, bool)>, StoreError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            debug!("skipping non-UTF-8 intake entry in {}", dir.display());
            continue;
        };
        if is_ignored(&name) {
            continue;
        }
        let ft = entry.file_type()?;
        out.push((name, entry.path(), ft.is_dir()));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// List the candidates in `{intake}` and its component subdirectories, in
/// sorted path order. A missing intake directory yields no candidates.
///
/// Subdirectories are reported with their name as component even if the
/// distribution does not know it; the compiler rejects those.
pub fn scan_intake(intake_dir: &Path) -> Result<Vec<IntakeCandidate>, StoreError> {
    if !intake_dir.exists() {
        return Ok(Vec::new());
    }
    let mut candidates = Vec::new();
    for (name, path, is_dir) in regular_files(intake_dir)? {
        if is_dir {
            for (_, sub_path, sub_is_dir) in regular_files(&path)? {
                if sub_is_dir {
                    debug!("ignoring nested directory {}", sub_path.display());
                    continue;
                }
                candidates.push(IntakeCandidate::load(sub_path, Some(name.clone()))?);
            }
        } else {
            candidates.push(IntakeCandidate::load(path, None)?);
        }
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(candidates)
}
