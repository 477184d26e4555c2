//! apt source entries for `repository_source` resources.

use crate::CatalogError;
use fleetrepo_schema::RepositorySource;
use fleetrepo_store::write_atomic_mode;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every file fleetrepo owns in the sources and keyring directories.
pub const MANAGED_PREFIX: &str = "fleetrepo-";

/// Upper bound on a fetched signing key.
const MAX_KEY_SIZE: u64 = 1024 * 1024;

pub fn source_list_path(sources_dir: &Path, name: &str) -> PathBuf {
    sources_dir.join(format!("{MANAGED_PREFIX}{name}.list"))
}

pub fn key_path(keyring_dir: &Path, name: &str) -> PathBuf {
    keyring_dir.join(format!("{MANAGED_PREFIX}{name}.gpg"))
}

/// Render the one-line-style sources file for `src`.
pub fn render_source_list(name: &str, src: &RepositorySource, key: &Path) -> String {
    let options = format!("[signed-by={}]", key.display());
    let components = src.components.join(" ");
    let mut out = format!("# Managed by fleetrepo (repository_source/{name})\n");
    out.push_str(&format!(
        "deb {options} {} {} {components}\n",
        src.location_url, src.distribution
    ));
    if src.include_source {
        out.push_str(&format!(
            "deb-src {options} {} {} {components}\n",
            src.location_url, src.distribution
        ));
    }
    out
}

/// Fetch key material from an `http(s)://` URL, a `file://` URL or a plain
/// path. An HTTP fetch gives up after `timeout`.
pub fn fetch_key(source: &str, timeout: Duration) -> Result<Vec<u8>, CatalogError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        tracing::debug!("GET {source}");
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        let resp = match agent.get(source).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => {
                return Err(CatalogError::Http(format!("HTTP {code} for {source}")));
            }
            Err(e) => return Err(CatalogError::Http(e.to_string())),
        };
        let mut body = Vec::new();
        resp.into_body()
            .into_reader()
            .take(MAX_KEY_SIZE)
            .read_to_end(&mut body)
            .map_err(|e| CatalogError::Http(e.to_string()))?;
        if body.is_empty() {
            return Err(CatalogError::Http(format!("empty key from {source}")));
        }
        return Ok(body);
    }
    let path = source.strip_prefix("file://").unwrap_or(source);
    let data = fs::read(path)?;
    if data.is_empty() {
        return Err(CatalogError::Config(format!("empty key file {path}")));
    }
    Ok(data)
}

/// Write `data` to `path` only when the content differs. Returns whether the
/// file changed.
pub fn write_if_changed(path: &Path, data: &[u8]) -> Result<bool, CatalogError> {
    match fs::read(path) {
        Ok(existing) if existing == data => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    write_atomic_mode(path, data, 0o644)?;
    Ok(true)
}

/// Delete a managed file; a missing file is fine.
pub fn remove_managed(path: &Path) -> Result<bool, CatalogError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Names of the `fleetrepo-{name}.list` files present in `sources_dir`.
pub fn managed_source_names(sources_dir: &Path) -> Result<Vec<String>, CatalogError> {
    if !sources_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(sources_dir)? {
        let entry = entry?;
        let Some(file) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some(name) = file
            .strip_prefix(MANAGED_PREFIX)
            .and_then(|rest| rest.strip_suffix(".list"))
        {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names)
}
