use crate::StoreError;
use fleetrepo_schema::Distribution;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of one repository under its `basedir`.
///
/// ```text
/// {basedir}/incoming/{dist}[/{component}]/   intake, written by uploaders
/// {basedir}/quarantine/{dist}/               rejected uploads with .reason notes
/// {basedir}/pool/{sha256}                    accepted package files
/// {basedir}/snapshots/{dist}/{id}/           compiled, signed snapshots
/// {basedir}/public/                          document root
/// {basedir}/public/{dist} -> ../snapshots/{dist}/{id}
/// {basedir}/public/{repo}.gpg                public signing key
/// ```
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn intake_root(&self) -> PathBuf {
        self.root.join("incoming")
    }

    #[inline]
    pub fn intake_dir(&self, dist: &str) -> PathBuf {
        self.intake_root().join(dist)
    }

    #[inline]
    pub fn quarantine_dir(&self, dist: &str) -> PathBuf {
        self.root.join("quarantine").join(dist)
    }

    #[inline]
    pub fn pool_dir(&self) -> PathBuf {
        self.root.join("pool")
    }

    #[inline]
    pub fn snapshots_dir(&self, dist: &str) -> PathBuf {
        self.root.join("snapshots").join(dist)
    }

    #[inline]
    pub fn snapshot_path(&self, dist: &str, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir(dist).join(snapshot_id)
    }

    /// Document root handed to the static file server.
    #[inline]
    pub fn docroot(&self) -> PathBuf {
        self.root.join("public")
    }

    /// The symlink the publisher serves for a distribution.
    #[inline]
    pub fn published_link(&self, dist: &str) -> PathBuf {
        self.docroot().join(dist)
    }

    #[inline]
    pub fn public_key_path(&self, repo_name: &str) -> PathBuf {
        self.docroot().join(format!("{repo_name}.gpg"))
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    fn version_path(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// Create the directory skeleton, including one intake directory per
    /// distribution and component.
    pub fn initialize(&self, distributions: &[Distribution]) -> Result<(), StoreError> {
        fs::create_dir_all(self.pool_dir())?;
        fs::create_dir_all(self.docroot())?;
        for dist in distributions {
            fs::create_dir_all(self.intake_dir(&dist.name))?;
            for component in &dist.components {
                fs::create_dir_all(self.intake_dir(&dist.name).join(component))?;
            }
            fs::create_dir_all(self.quarantine_dir(&dist.name))?;
            fs::create_dir_all(self.snapshots_dir(&dist.name))?;
        }

        if self.version_path().exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&self.version_path(), content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.version_path())?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
