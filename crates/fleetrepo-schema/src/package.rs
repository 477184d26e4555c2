use crate::types::Checksum;
use crate::version::{compare_versions, is_valid_version};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// File extensions accepted from intake.
pub const PACKAGE_EXTENSIONS: &[&str] = &["deb", "udeb"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
    #[error("not a package file: '{0}'")]
    NotAPackage(String),
    #[error("cannot parse package filename '{0}', expected name_version_arch.deb")]
    BadFilename(String),
}

/// Package identity parsed from a Debian-style filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageName {
    pub name: String,
    pub version: String,
    pub architecture: String,
}

/// Parse `name_version_arch.deb`, or the short `name-version_arch.deb` form
/// where the version starts at the last `-` followed by a digit.
pub fn parse_package_filename(filename: &str) -> Result<PackageName, PackageError> {
    let stem = PACKAGE_EXTENSIONS
        .iter()
        .find_map(|ext| filename.strip_suffix(&format!(".{ext}")[..]))
        .ok_or_else(|| PackageError::NotAPackage(filename.to_owned()))?;
    let bad = || PackageError::BadFilename(filename.to_owned());

    let parts: Vec<&str> = stem.split('_').collect();
    let (name, version, architecture) = match parts.as_slice() {
        [name, version, arch] => ((*name).to_owned(), (*version).to_owned(), *arch),
        [name_version, arch] => {
            let idx = name_version
                .match_indices('-')
                .map(|(i, _)| i)
                .rfind(|&i| {
                    name_version[i + 1..]
                        .bytes()
                        .next()
                        .is_some_and(|b| b.is_ascii_digit())
                })
                .ok_or_else(bad)?;
            (
                name_version[..idx].to_owned(),
                name_version[idx + 1..].to_owned(),
                *arch,
            )
        }
        _ => return Err(bad()),
    };

    // Epochs are escaped in pool filenames.
    let version = version.replace("%3a", ":").replace("%3A", ":");

    let valid_name = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.'));
    let valid_version = !version.is_empty()
        && is_valid_version(&version)
        && version.bytes().next().is_some_and(|b| b.is_ascii_digit())
        && version
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'+' | b'-' | b'~' | b':'));
    let valid_arch =
        !architecture.is_empty() && architecture.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
    if !(valid_name && valid_version && valid_arch) {
        return Err(bad());
    }

    Ok(PackageName {
        name,
        version,
        architecture: architecture.to_owned(),
    })
}

/// An accepted package artifact. Immutable once it is part of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub component: String,
    pub distribution: String,
    /// Path relative to the document root, e.g. `stable/main/amd64/foo_1.0_amd64.deb`.
    pub path: String,
    pub size: u64,
    pub checksum: Checksum,
}

impl PackageFile {
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Whether `other` names the same package build.
    pub fn same_build(&self, other: &PackageFile) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.architecture == other.architecture
    }
}

/// Canonical index order: name, then Debian version, then architecture, then checksum.
pub fn index_order(a: &PackageFile, b: &PackageFile) -> Ordering {
    a.name
        .cmp(&b.name)
        .then_with(|| compare_versions(&a.version, &b.version))
        .then_with(|| a.architecture.cmp(&b.architecture))
        .then_with(|| a.checksum.cmp(&b.checksum))
}

/// Published path of a package file relative to the document root.
pub fn package_path(distribution: &str, component: &str, architecture: &str, filename: &str) -> String {
    format!("{distribution}/{component}/{architecture}/{filename}")
}
