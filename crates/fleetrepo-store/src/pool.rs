use crate::layout::RepoLayout;
use crate::{fsync_dir, StoreError};
use fleetrepo_schema::Checksum;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const BUF_SIZE: usize = 64 * 1024;

pub fn sha256_bytes(data: &[u8]) -> Checksum {
    Checksum::new(hex::encode(Sha256::digest(data)))
}

/// Stream a file through SHA-256 and return its lowercase hex digest and size.
pub fn sha256_file(path: &Path) -> Result<(Checksum, u64), StoreError> {
    let mut file = File::open(path)?;
    sha256_reader(&mut file, io::sink())
}

fn sha256_reader<R: Read, W: Write>(reader: &mut R, mut copy_to: W) -> Result<(Checksum, u64), StoreError> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        copy_to.write_all(&buf[..n])?;
        size += n as u64;
    }
    Ok((Checksum::new(hex::encode(hasher.finalize())), size))
}

/// Content-addressable package pool keyed by SHA-256.
///
/// Every accepted package file is stored once as `pool/{sha256}`, regardless
/// of how many distributions, components or architectures list it. Snapshots
/// hard-link their package files out of the pool.
pub struct PackagePool {
    layout: RepoLayout,
}

impl PackagePool {
    pub fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }

    #[inline]
    pub fn path(&self, checksum: &Checksum) -> PathBuf {
        self.layout.pool_dir().join(checksum.as_str())
    }

    /// Copy `source` into the pool, hashing while copying. Returns the digest
    /// and size of the bytes actually stored. Idempotent: an existing entry
    /// with the same digest is kept and the temp copy discarded.
    pub fn put_file(&self, source: &Path) -> Result<(Checksum, u64), StoreError> {
        let dir = self.layout.pool_dir();
        fs::create_dir_all(&dir)?;

        let mut input = File::open(source)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        let (checksum, size) = sha256_reader(&mut input, tmp.as_file_mut())?;
        let dest = self.path(&checksum);

        if dest.exists() {
            return Ok((checksum, size));
        }

        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok((checksum, size))
    }

    /// Retrieve a package's bytes, verifying the digest on read.
    pub fn get(&self, checksum: &Checksum) -> Result<Vec<u8>, StoreError> {
        let path = self.path(checksum);
        if !path.exists() {
            return Err(StoreError::PackageNotFound(checksum.to_string()));
        }
        let data = fs::read(&path)?;
        let actual = sha256_bytes(&data);
        if actual != *checksum {
            return Err(StoreError::IntegrityFailure {
                key: checksum.to_string(),
                expected: checksum.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(data)
    }

    /// Re-hash a pool entry without loading it into memory.
    pub fn verify(&self, checksum: &Checksum) -> Result<(), StoreError> {
        let path = self.path(checksum);
        if !path.exists() {
            return Err(StoreError::PackageNotFound(checksum.to_string()));
        }
        let (actual, _) = sha256_file(&path)?;
        if actual != *checksum {
            return Err(StoreError::IntegrityFailure {
                key: checksum.to_string(),
                expected: checksum.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(())
    }

    pub fn exists(&self, checksum: &Checksum) -> bool {
        self.path(checksum).exists()
    }

    pub fn remove(&self, checksum: &Checksum) -> Result<(), StoreError> {
        let path = self.path(checksum);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Checksum>, StoreError> {
        let dir = self.layout.pool_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sums = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    sums.push(Checksum::new(name));
                }
            }
        }
        sums.sort();
        Ok(sums)
    }
}
