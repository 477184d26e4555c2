//! Repository compilation and scheduling for fleetrepo.
//!
//! This crate ties the store and the catalog together: the [`Keyring`]
//! signing service, `Packages`/`Release` rendering, the
//! [`RepositoryCompiler`] that turns intake files into a signed, atomically
//! published snapshot, published-tree verification, and the [`Scheduler`]
//! that drives compile and reconcile jobs on a node.

pub mod compiler;
pub mod concurrency;
pub mod index;
pub mod scheduler;
pub mod signing;
pub mod verify;

pub use compiler::{
    export_public_key, CompileReport, Rejection, RejectionReason, RepositoryCompiler,
};
pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use index::{render_packages, render_release, render_signature, parse_signature, ReleaseSignature};
pub use scheduler::{
    Announced, CompileJob, Job, JobStatus, ReconcileJob, ReconcileRun, Scheduler, TickReport,
};
pub use signing::{KeyRecord, Keyring, SigningError, SigningService};
pub use verify::verify_distribution;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] fleetrepo_schema::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] fleetrepo_store::StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] fleetrepo_catalog::CatalogError),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("'{0}' is locked by another operation")]
    Locked(String),
}

impl CoreError {
    /// Fatal errors stop the scheduler; everything else is retried on the
    /// job's next interval.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Signing(_))
    }
}
