//! Intake to signed snapshot.
//!
//! A compile merges the live index with validated intake files, renders and
//! signs the metadata, builds a complete snapshot directory in staging and
//! only then swaps the published symlink. Bad files are quarantined and the
//! compile continues; a signing failure aborts before anything is published.

use crate::index::{render_packages, render_release, render_signature};
use crate::signing::SigningService;
use crate::CoreError;
use chrono::Utc;
use fleetrepo_schema::{
    package_path, parse_package_filename, Checksum, Distribution, PackageFile, PackageIndex,
    RepoConfig, SnapshotId,
};
use fleetrepo_store::{
    scan_intake, sha256_bytes, sha256_file, write_atomic_mode, IntakeCandidate, PackagePool,
    Quarantine, ReleaseEntry, RepoLayout, RepositorySnapshot, SnapshotStore, StoreError,
};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hex chars of the blake3 digest used as snapshot id.
const SNAPSHOT_ID_LEN: usize = 16;

/// Why an intake file was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("checksum mismatch: sidecar says {expected}, file is {actual}")]
    ChecksumMismatch { expected: Checksum, actual: Checksum },
    #[error("missing .sha256 sidecar")]
    MissingChecksum,
    #[error("bad package filename: {detail}")]
    BadFilename { detail: String },
    #[error("architecture '{architecture}' is not allowed in this distribution")]
    DisallowedArchitecture { architecture: String },
    #[error("component '{component}' is not allowed in this distribution")]
    DisallowedComponent { component: String },
    #[error("{package} is already indexed with checksum {existing}")]
    Conflict { package: String, existing: Checksum },
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub filename: String,
    pub reason: RejectionReason,
    pub quarantined_to: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub distribution: String,
    /// Live snapshot after the compile.
    pub snapshot_id: SnapshotId,
    /// Nothing changed; the previous snapshot stays live untouched.
    pub unchanged: bool,
    pub accepted: Vec<PackageFile>,
    pub duplicates: Vec<String>,
    pub rejected: Vec<Rejection>,
    pub pruned: Vec<SnapshotId>,
    pub package_count: usize,
}

impl CompileReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Result of validating one candidate.
enum Verdict {
    Accept(PackageFile, Vec<String>),
    Duplicate,
    Reject(RejectionReason),
}

pub struct RepositoryCompiler<'a> {
    layout: RepoLayout,
    signer: &'a dyn SigningService,
    keep_snapshots: usize,
}

impl<'a> RepositoryCompiler<'a> {
    pub fn new(layout: RepoLayout, signer: &'a dyn SigningService, keep_snapshots: usize) -> Self {
        Self {
            layout,
            signer,
            keep_snapshots,
        }
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// Compile `dist` from its live snapshot and current intake.
    ///
    /// The caller must hold the repository lock.
    pub fn compile(&self, dist: &Distribution) -> Result<CompileReport, CoreError> {
        self.layout.initialize(std::slice::from_ref(dist))?;
        let snapshots = SnapshotStore::new(self.layout.clone());
        let pool = PackagePool::new(self.layout.clone());
        let quarantine = Quarantine::new(self.layout.clone());

        let current = snapshots.current(&dist.name)?;
        let mut index = rebase(current.as_ref().map(|s| &s.index), dist);

        let candidates = scan_intake(&self.layout.intake_dir(&dist.name))?;
        debug!("{}: {} intake candidates", dist.name, candidates.len());

        let mut accepted = Vec::new();
        let mut consumed: Vec<&IntakeCandidate> = Vec::new();
        let mut duplicates = Vec::new();
        let mut rejected = Vec::new();

        for candidate in &candidates {
            match self.validate(dist, &index, candidate, &pool)? {
                Verdict::Accept(package, archs) => {
                    for arch in &archs {
                        index.insert(&package.component, arch, package.clone());
                    }
                    debug!("accepted {}", package.path);
                    accepted.push(package);
                    consumed.push(candidate);
                }
                Verdict::Duplicate => {
                    debug!("{}: {} already indexed", dist.name, candidate.filename);
                    duplicates.push(candidate.filename.clone());
                    consumed.push(candidate);
                }
                Verdict::Reject(reason) => {
                    let quarantined_to = quarantine.quarantine(&dist.name, candidate, &reason.to_string())?;
                    rejected.push(Rejection {
                        filename: candidate.filename.clone(),
                        reason,
                        quarantined_to,
                    });
                }
            }
        }
        index.sort();

        // Keep the old date while the index is unchanged so that a no-op
        // compile renders byte-identical metadata.
        let generated_at = match &current {
            Some(snap) if snap.index == index => snap.generated_at,
            _ => Utc::now(),
        };
        let packages: Vec<(String, String)> = index
            .groups()
            .map(|(comp, arch, pkgs)| (format!("{comp}/{arch}/Packages"), render_packages(pkgs)))
            .collect();
        let entries: Vec<ReleaseEntry> = packages
            .iter()
            .map(|(path, text)| ReleaseEntry {
                checksum: sha256_bytes(text.as_bytes()),
                size: text.len() as u64,
                path: path.clone(),
            })
            .collect();
        let release = render_release(dist, generated_at, &entries);

        if let Some(snap) = &current {
            let live_release = fs::read(self.layout.snapshot_path(&dist.name, &snap.snapshot_id).join("Release"))
                .unwrap_or_default();
            if snap.key_id == dist.signing_key_id && live_release == release.as_bytes() {
                remove_consumed(&consumed);
                info!("{}: unchanged at {}", dist.name, snap.snapshot_id);
                return Ok(CompileReport {
                    distribution: dist.name.clone(),
                    snapshot_id: snap.snapshot_id.clone(),
                    unchanged: true,
                    accepted,
                    duplicates,
                    rejected,
                    pruned: Vec::new(),
                    package_count: index.package_count(),
                });
            }
        }

        let signature = self.signer.sign(release.as_bytes(), &dist.signing_key_id)?;
        let sig_file = render_signature(&dist.signing_key_id, &signature);
        let snapshot_id = snapshot_id(&release, &sig_file);

        let builder = snapshots.builder(&dist.name)?;
        let prefix = format!("{}/", dist.name);
        for (path, package) in index.files() {
            let pool_path = pool.path(&package.checksum);
            if !pool.exists(&package.checksum) {
                return Err(StoreError::PackageNotFound(package.checksum.to_string()).into());
            }
            let rel = path.strip_prefix(&prefix).unwrap_or(path);
            builder.link_package(&pool_path, rel)?;
        }
        for (path, text) in &packages {
            builder.write_file(path, text.as_bytes())?;
        }
        builder.write_file("Release", release.as_bytes())?;
        builder.write_file("Release.sig", sig_file.as_bytes())?;

        let snapshot = RepositorySnapshot {
            distribution: dist.name.clone(),
            snapshot_id: snapshot_id.clone(),
            generated_at,
            key_id: dist.signing_key_id.clone(),
            index,
            metadata_signature: signature,
            checksum: None,
        };
        builder.finish(&snapshot)?;
        snapshots.publish(&dist.name, &snapshot_id)?;

        remove_consumed(&consumed);
        let pruned = match snapshots.prune(&dist.name, self.keep_snapshots) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: pruning old snapshots failed: {e}", dist.name);
                Vec::new()
            }
        };

        info!(
            "{}: published {snapshot_id} ({} new, {} duplicate, {} rejected)",
            dist.name,
            accepted.len(),
            duplicates.len(),
            rejected.len()
        );
        Ok(CompileReport {
            distribution: dist.name.clone(),
            snapshot_id,
            unchanged: false,
            accepted,
            duplicates,
            rejected,
            pruned,
            package_count: snapshot.index.package_count(),
        })
    }

    fn validate(
        &self,
        dist: &Distribution,
        index: &PackageIndex,
        candidate: &IntakeCandidate,
        pool: &PackagePool,
    ) -> Result<Verdict, CoreError> {
        let component = candidate
            .component
            .clone()
            .unwrap_or_else(|| dist.default_component().to_owned());
        if !dist.has_component(&component) {
            return Ok(Verdict::Reject(RejectionReason::DisallowedComponent { component }));
        }
        if !candidate.has_package_extension() {
            return Ok(Verdict::Reject(RejectionReason::BadFilename {
                detail: format!("'{}' is not a .deb or .udeb", candidate.filename),
            }));
        }
        let name = match parse_package_filename(&candidate.filename) {
            Ok(n) => n,
            Err(e) => {
                return Ok(Verdict::Reject(RejectionReason::BadFilename {
                    detail: e.to_string(),
                }))
            }
        };
        if !dist.accepts_architecture(&name.architecture) {
            return Ok(Verdict::Reject(RejectionReason::DisallowedArchitecture {
                architecture: name.architecture,
            }));
        }
        let Some(expected) = &candidate.expected_checksum else {
            return Ok(Verdict::Reject(RejectionReason::MissingChecksum));
        };
        let (actual, size) = sha256_file(&candidate.path)?;
        if actual != *expected {
            return Ok(Verdict::Reject(RejectionReason::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            }));
        }

        let targets = target_architectures(dist, &name.architecture);
        let package = PackageFile {
            path: package_path(&dist.name, &component, &name.architecture, &candidate.filename),
            name: name.name,
            version: name.version,
            architecture: name.architecture,
            component,
            distribution: dist.name.clone(),
            size,
            checksum: actual,
        };

        if targets
            .iter()
            .all(|arch| index.contains_checksum(&package.component, arch, &package.checksum))
        {
            return Ok(Verdict::Duplicate);
        }
        for arch in &targets {
            if let Some(existing) = index.find_build(&package.component, arch, &package) {
                if existing.checksum != package.checksum {
                    return Ok(Verdict::Reject(RejectionReason::Conflict {
                        package: format!("{}_{}_{}", package.name, package.version, package.architecture),
                        existing: existing.checksum.clone(),
                    }));
                }
            }
        }

        // The file may have changed since it was hashed; the pool hashes
        // again while copying.
        let (stored, _) = pool.put_file(&candidate.path)?;
        if stored != package.checksum {
            return Ok(Verdict::Reject(RejectionReason::ChecksumMismatch {
                expected: package.checksum,
                actual: stored,
            }));
        }
        let targets = targets
            .into_iter()
            .filter(|arch| !index.contains_checksum(&package.component, arch, &package.checksum))
            .collect();
        Ok(Verdict::Accept(package, targets))
    }
}

/// Architectures whose `Packages` list a package of `arch`.
fn target_architectures(dist: &Distribution, arch: &str) -> Vec<String> {
    if arch == "all" {
        dist.architectures.iter().cloned().collect()
    } else {
        vec![arch.to_owned()]
    }
}

/// Re-place the live index onto the distribution's current groups. Every
/// configured `(component, architecture)` gets a group, `all` packages are
/// listed under every architecture, and packages whose group is no longer
/// configured are dropped.
fn rebase(existing: Option<&PackageIndex>, dist: &Distribution) -> PackageIndex {
    let mut index = PackageIndex::new();
    for comp in &dist.components {
        for arch in &dist.architectures {
            index.ensure_group(comp, arch);
        }
    }
    let Some(existing) = existing else {
        return index;
    };
    for (comp, _, packages) in existing.groups() {
        for p in packages {
            if !dist.has_component(comp) || !dist.accepts_architecture(&p.architecture) {
                warn!("{}: dropping {} (no longer configured)", dist.name, p.path);
                continue;
            }
            for arch in target_architectures(dist, &p.architecture) {
                if !index.contains_checksum(comp, &arch, &p.checksum) {
                    index.insert(comp, &arch, p.clone());
                }
            }
        }
    }
    index.sort();
    index
}

fn snapshot_id(release: &str, sig_file: &str) -> SnapshotId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(release.as_bytes());
    hasher.update(sig_file.as_bytes());
    let hex = hasher.finalize().to_hex();
    SnapshotId::new(&hex[..SNAPSHOT_ID_LEN])
}

/// Incorporated files leave intake only once their snapshot is live. A file
/// that cannot be removed is absorbed as a duplicate next time.
fn remove_consumed(consumed: &[&IntakeCandidate]) {
    for candidate in consumed {
        if let Err(e) = candidate.remove() {
            warn!("cannot remove {} from intake: {e}", candidate.path.display());
        }
    }
}

/// Write the repository's public key to `{docroot}/{name}.gpg`, from
/// `key_file` when configured, otherwise from the signing keyring. Returns
/// the path and whether the file changed.
pub fn export_public_key(
    config: &RepoConfig,
    signer: &dyn SigningService,
) -> Result<(PathBuf, bool), CoreError> {
    let repo = &config.repository;
    let data = match &repo.key_file {
        Some(path) => fs::read(path)?,
        None => format!("{}\n", signer.public_key(&repo.key_id)?).into_bytes(),
    };
    let layout = RepoLayout::new(&repo.basedir);
    let dest = layout.public_key_path(&repo.name);
    if fs::read(&dest).is_ok_and(|existing| existing == data) {
        return Ok((dest, false));
    }
    write_atomic_mode(&dest, &data, 0o644)?;
    info!("exported public key to {}", dest.display());
    Ok((dest, true))
}
