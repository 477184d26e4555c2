use crate::resource::{is_valid_hostname, FleetNode};
use crate::types::{validate_name, InvalidName, KeyId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Distribution name used when the config lists no `[[distribution]]`.
pub const DEFAULT_RELEASE: &str = "stable";
pub const DEFAULT_KEEP_SNAPSHOTS: usize = 3;
pub const DEFAULT_COMPILE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 1800;
pub const DEFAULT_CATALOG_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("config: {0}")]
    InvalidName(#[from] InvalidName),
    #[error("config: distribution '{distribution}' has an empty {field} set")]
    EmptySet {
        distribution: String,
        field: &'static str,
    },
    #[error("config: distribution '{0}' is declared more than once")]
    DuplicateDistribution(String),
    #[error("config: unknown distribution '{0}'")]
    UnknownDistribution(String),
    #[error("config: missing [{0}] section")]
    MissingSection(&'static str),
    #[error("config: {0}")]
    Invalid(String),
}

/// Top-level `fleetrepo.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    pub repository: RepositorySection,
    #[serde(default, rename = "distribution")]
    pub distributions: Vec<DistributionSection>,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub node: Option<NodeSection>,
    #[serde(default)]
    pub announce: Option<AnnounceSection>,
    #[serde(default)]
    pub catalog: CatalogSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RepositorySection {
    pub name: String,
    pub basedir: PathBuf,
    pub domain: String,
    pub key_id: KeyId,
    /// Public key material published as `{docroot}/{name}.gpg`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Directory holding private signing keys. Defaults to `{basedir}/keys`.
    #[serde(default)]
    pub keyring: Option<PathBuf>,
    #[serde(default = "default_release")]
    pub release: String,
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,
}

impl RepositorySection {
    /// The domain without a trailing slash or port: the name announced in
    /// `dns_address` resources.
    pub fn announced_hostname(&self) -> &str {
        let domain = self.domain.trim_end_matches('/');
        domain.split(':').next().unwrap_or(domain)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DistributionSection {
    pub name: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub suite: Option<String>,
    pub architectures: Vec<String>,
    pub components: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub signing_key_id: Option<KeyId>,
    #[serde(default)]
    pub not_automatic: bool,
    #[serde(default = "default_true")]
    pub auto_promote: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSection {
    #[serde(default = "default_compile_interval")]
    pub compile_interval_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            compile_interval_secs: DEFAULT_COMPILE_INTERVAL_SECS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub id: NodeId,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Shared catalog: a directory path or an `http(s)://` URL.
    pub catalog: String,
    #[serde(default = "default_sources_dir")]
    pub sources_dir: PathBuf,
    #[serde(default = "default_keyring_dir")]
    pub keyring_dir: PathBuf,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl NodeSection {
    pub fn fleet_node(&self) -> FleetNode {
        FleetNode {
            node_id: self.id.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Client settings for catalog and key-server requests.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CatalogSection {
    /// Upper bound on one HTTP request, connect to last body byte.
    #[serde(default = "default_catalog_timeout")]
    pub timeout_secs: u64,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_CATALOG_TIMEOUT_SECS,
        }
    }
}

impl CatalogSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What a repository host exports to the catalog on every reconcile.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AnnounceSection {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub distribution: Option<String>,
    #[serde(default)]
    pub include_source: bool,
}

/// A fully resolved distribution: every optional field filled in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distribution {
    pub name: String,
    pub origin: String,
    pub label: String,
    pub suite: String,
    pub architectures: BTreeSet<String>,
    /// Ordered; the first entry receives files dropped at the intake root.
    pub components: Vec<String>,
    pub description: String,
    pub signing_key_id: KeyId,
    pub not_automatic: bool,
    pub auto_promote: bool,
}

impl Distribution {
    pub fn default_component(&self) -> &str {
        self.components.first().map_or("main", String::as_str)
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }

    /// `all` matches every configured architecture.
    pub fn accepts_architecture(&self, arch: &str) -> bool {
        arch == "all" || self.architectures.contains(arch)
    }
}

impl RepoConfig {
    /// Check names and sets that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.repository.name)?;
        validate_name(&self.repository.release)?;
        if self.repository.domain.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "repository.domain must not be empty".to_owned(),
            ));
        }
        validate_name(&self.repository.key_id)?;

        let mut seen = HashSet::new();
        for dist in &self.distributions {
            validate_name(&dist.name)?;
            if !seen.insert(dist.name.as_str()) {
                return Err(ConfigError::DuplicateDistribution(dist.name.clone()));
            }
            if dist.architectures.is_empty() {
                return Err(ConfigError::EmptySet {
                    distribution: dist.name.clone(),
                    field: "architectures",
                });
            }
            if dist.components.is_empty() {
                return Err(ConfigError::EmptySet {
                    distribution: dist.name.clone(),
                    field: "components",
                });
            }
            for name in dist.architectures.iter().chain(&dist.components) {
                validate_name(name)?;
            }
            if dist.architectures.iter().any(|a| a == "all") {
                return Err(ConfigError::Invalid(format!(
                    "distribution '{}': 'all' is implied and must not be listed",
                    dist.name
                )));
            }
        }

        if let Some(node) = &self.node {
            validate_name(&node.id)?;
            if node.catalog.trim().is_empty() {
                return Err(ConfigError::Invalid("node.catalog must not be empty".to_owned()));
            }
        }

        if self.catalog.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "catalog.timeout_secs must be at least 1".to_owned(),
            ));
        }

        if let Some(announce) = &self.announce {
            self.validate_announce(announce)?;
        }
        Ok(())
    }

    fn validate_announce(&self, announce: &AnnounceSection) -> Result<(), ConfigError> {
        for tag in &announce.tags {
            validate_name(tag)?;
        }
        if let Some(dist) = &announce.distribution {
            if !self.distributions().iter().any(|d| &d.name == dist) {
                return Err(ConfigError::UnknownDistribution(dist.clone()));
            }
        }
        if let Some(ip) = &announce.ip {
            if ip.parse::<IpAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "announce.ip: invalid IP address '{ip}'"
                )));
            }
            let host = self.repository.announced_hostname();
            if !is_valid_hostname(host) {
                return Err(ConfigError::Invalid(format!(
                    "repository.domain: '{host}' is not a valid host name to announce"
                )));
            }
        }
        Ok(())
    }

    /// Resolved distributions, synthesising the default one when none is declared.
    pub fn distributions(&self) -> Vec<Distribution> {
        if self.distributions.is_empty() {
            let name = self.repository.release.clone();
            return vec![Distribution {
                origin: self.repository.name.clone(),
                label: self.repository.name.clone(),
                suite: name.clone(),
                name,
                architectures: BTreeSet::from(["amd64".to_owned()]),
                components: vec!["main".to_owned()],
                description: String::new(),
                signing_key_id: self.repository.key_id.clone(),
                not_automatic: false,
                auto_promote: true,
            }];
        }

        self.distributions
            .iter()
            .map(|d| {
                let mut components: Vec<String> = Vec::with_capacity(d.components.len());
                for c in &d.components {
                    if !components.contains(c) {
                        components.push(c.clone());
                    }
                }
                Distribution {
                    name: d.name.clone(),
                    origin: d
                        .origin
                        .clone()
                        .unwrap_or_else(|| self.repository.name.clone()),
                    label: d
                        .label
                        .clone()
                        .unwrap_or_else(|| self.repository.name.clone()),
                    suite: d.suite.clone().unwrap_or_else(|| d.name.clone()),
                    architectures: d.architectures.iter().cloned().collect(),
                    components,
                    description: d.description.clone(),
                    signing_key_id: d
                        .signing_key_id
                        .clone()
                        .unwrap_or_else(|| self.repository.key_id.clone()),
                    not_automatic: d.not_automatic,
                    auto_promote: d.auto_promote,
                }
            })
            .collect()
    }

    pub fn distribution(&self, name: &str) -> Result<Distribution, ConfigError> {
        self.distributions()
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::UnknownDistribution(name.to_owned()))
    }

    pub fn keyring_dir(&self) -> PathBuf {
        self.repository
            .keyring
            .clone()
            .unwrap_or_else(|| self.repository.basedir.join("keys"))
    }

    pub fn node(&self) -> Result<&NodeSection, ConfigError> {
        self.node.as_ref().ok_or(ConfigError::MissingSection("node"))
    }
}

fn default_release() -> String {
    DEFAULT_RELEASE.to_owned()
}

fn default_keep_snapshots() -> usize {
    DEFAULT_KEEP_SNAPSHOTS
}

fn default_true() -> bool {
    true
}

fn default_compile_interval() -> u64 {
    DEFAULT_COMPILE_INTERVAL_SECS
}

fn default_reconcile_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

fn default_catalog_timeout() -> u64 {
    DEFAULT_CATALOG_TIMEOUT_SECS
}

fn default_sources_dir() -> PathBuf {
    PathBuf::from("/etc/apt/sources.list.d")
}

fn default_keyring_dir() -> PathBuf {
    PathBuf::from("/etc/apt/keyrings")
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetrepo/node")
}

/// Parse and validate a config document.
pub fn parse_config_str(input: &str) -> Result<RepoConfig, ConfigError> {
    let config: RepoConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<RepoConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
