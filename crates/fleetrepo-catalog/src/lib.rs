//! Fleet-wide resource catalog and the per-node catalog compiler.
//!
//! Any node declares tagged [`Resource`]s into a shared catalog through a
//! [`CatalogBackend`] (a shared directory or the HTTP routes of
//! `fleetrepo-server`). Every node periodically pulls the resources whose tags
//! intersect its own and the [`CatalogCompiler`] reconciles local apt sources
//! and hosts entries to exactly that set.

pub mod announce;
pub mod apt;
pub mod file;
pub mod hosts;
pub mod http;
pub mod reconcile;
pub mod state;

pub use announce::{announce_resources, Announcement};
pub use file::FileCatalog;
pub use http::HttpCatalog;
pub use reconcile::{CatalogCompiler, NodePaths, ReconcileReport};
pub use state::AppliedState;

use fleetrepo_schema::{NodeId, Resource, ResourceId, ResourceKind};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Protocol version sent as `X-Fleetrepo-Protocol` header on catalog requests.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request timeout used when the caller has no `[catalog]` setting at hand.
pub const DEFAULT_TIMEOUT: Duration =
    Duration::from_secs(fleetrepo_schema::DEFAULT_CATALOG_TIMEOUT_SECS);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("store error: {0}")]
    Store(#[from] fleetrepo_store::StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid resource: {0}")]
    Invalid(#[from] fleetrepo_schema::ResourceError),
    #[error("{id} is owned by '{owner}', not '{node}'")]
    NotOwner {
        id: ResourceId,
        owner: NodeId,
        node: NodeId,
    },
    #[error("failed to apply {id}: {reason}")]
    Apply { id: ResourceId, reason: String },
    #[error("catalog config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclareOutcome {
    /// Stored; it is now the current entry for its identity.
    Declared,
    /// A strictly newer declaration of the same identity already exists.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractOutcome {
    Retracted,
    Missing,
}

/// A fleet-shared store of resources keyed by `(kind, name)`.
pub trait CatalogBackend: Send + Sync {
    /// Upsert by identity with last-write-wins on `(declared_at, declared_by)`.
    fn declare(&self, resource: &Resource) -> Result<DeclareOutcome, CatalogError>;

    /// Remove an entry. Only the node that declared it may retract it.
    fn retract(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &NodeId,
    ) -> Result<RetractOutcome, CatalogError>;

    /// Every resource whose tags intersect `tags`. Read-only.
    fn pull(&self, tags: &BTreeSet<String>) -> Result<Vec<Resource>, CatalogError>;

    /// Every resource in the catalog.
    fn list(&self) -> Result<Vec<Resource>, CatalogError>;
}

/// Open the catalog named by a `[node] catalog` setting: an `http(s)://` URL
/// or a shared directory path. `timeout` bounds each HTTP request.
pub fn open_catalog(
    location: &str,
    timeout: Duration,
) -> Result<Box<dyn CatalogBackend>, CatalogError> {
    if location.is_empty() {
        return Err(CatalogError::Config("catalog location is empty".to_owned()));
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpCatalog::with_timeout(location, timeout)))
    } else {
        Ok(Box::new(FileCatalog::new(location)))
    }
}
