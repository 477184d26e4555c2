//! Declarative fleet resources and tag matching.
//!
//! A resource is identified by `(kind, name)`. Nodes pull every resource whose
//! tag set intersects their own.

use crate::types::{validate_name, InvalidName, KeyId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("{0}")]
    InvalidName(#[from] InvalidName),
    #[error("unknown resource kind '{0}'")]
    UnknownKind(String),
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("invalid IP address '{0}'")]
    InvalidIp(String),
    #[error("invalid hostname '{0}'")]
    InvalidHostname(String),
    #[error("repository source '{0}' lists no components")]
    EmptyComponents(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    RepositorySource,
    DnsAddress,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::RepositorySource, ResourceKind::DnsAddress];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::RepositorySource => "repository_source",
            ResourceKind::DnsAddress => "dns_address",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository_source" | "repository-source" | "RepositorySource" => {
                Ok(ResourceKind::RepositorySource)
            }
            "dns_address" | "dns-address" | "DNSAddress" | "DnsAddress" => {
                Ok(ResourceKind::DnsAddress)
            }
            other => Err(ResourceError::UnknownKind(other.to_owned())),
        }
    }
}

/// A package repository every matching node should configure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySource {
    pub location_url: String,
    pub distribution: String,
    pub components: Vec<String>,
    pub key_id: KeyId,
    pub key_source_url: String,
    #[serde(default)]
    pub include_source: bool,
}

/// A host address record every matching node should resolve locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAddress {
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourcePayload {
    RepositorySource(RepositorySource),
    DnsAddress(DnsAddress),
}

impl ResourcePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourcePayload::RepositorySource(_) => ResourceKind::RepositorySource,
            ResourcePayload::DnsAddress(_) => ResourceKind::DnsAddress,
        }
    }
}

/// Identity of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Wire form: `{name, tags, declared_by, declared_at, payload}` where
/// `payload` carries the `kind` tag next to the variant's fields. A `kind`
/// at the top level is refused rather than ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resource {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub declared_by: NodeId,
    pub declared_at: DateTime<Utc>,
    pub payload: ResourcePayload,
}

impl Resource {
    /// Declare a resource now.
    pub fn new(
        name: impl Into<String>,
        tags: BTreeSet<String>,
        declared_by: NodeId,
        payload: ResourcePayload,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            declared_by,
            declared_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.payload.kind()
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind(), self.name.clone())
    }

    /// Non-empty intersection with `tags`.
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }

    /// Whether `self` wins over `other` under last-write-wins. Ties on the
    /// timestamp go to the lexically greater author so that every replica
    /// picks the same winner.
    pub fn supersedes(&self, other: &Resource) -> bool {
        (self.declared_at, &self.declared_by) >= (other.declared_at, &other.declared_by)
    }

    /// Blake3 over the name and payload. Tags and timestamps are excluded so
    /// that re-declaring an unchanged resource is a no-op for appliers.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        let payload = serde_json::to_vec(&self.payload).unwrap_or_default();
        hasher.update(&payload);
        hasher.finalize().to_hex().to_string()
    }

    pub fn validate(&self) -> Result<(), ResourceError> {
        validate_name(&self.name)?;
        validate_name(&self.declared_by)?;
        for tag in &self.tags {
            validate_name(tag)?;
        }
        match &self.payload {
            ResourcePayload::RepositorySource(src) => {
                validate_url(&src.location_url, false)?;
                validate_url(&src.key_source_url, true)?;
                validate_name(&src.distribution)?;
                validate_name(&src.key_id)?;
                if src.components.is_empty() {
                    return Err(ResourceError::EmptyComponents(self.name.clone()));
                }
                for c in &src.components {
                    validate_name(c)?;
                }
            }
            ResourcePayload::DnsAddress(addr) => {
                validate_hostname(&addr.hostname)?;
                addr.ip
                    .parse::<IpAddr>()
                    .map_err(|_| ResourceError::InvalidIp(addr.ip.clone()))?;
            }
        }
        Ok(())
    }
}

/// A managed machine and the tags that select what it pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetNode {
    pub node_id: NodeId,
    pub tags: BTreeSet<String>,
}

impl FleetNode {
    pub fn wants(&self, resource: &Resource) -> bool {
        resource.matches(&self.tags)
    }
}

/// Parse a comma-separated tag list, dropping blanks.
pub fn parse_tags(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

fn validate_url(url: &str, allow_file: bool) -> Result<(), ResourceError> {
    let invalid = || ResourceError::InvalidUrl(url.to_owned());
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .or_else(|| {
            if allow_file {
                url.strip_prefix("file://")
            } else {
                None
            }
        })
        .ok_or_else(invalid)?;
    if rest.is_empty() || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid());
    }
    Ok(())
}

pub(crate) fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

fn validate_hostname(hostname: &str) -> Result<(), ResourceError> {
    if is_valid_hostname(hostname) {
        Ok(())
    } else {
        Err(ResourceError::InvalidHostname(hostname.to_owned()))
    }
}
