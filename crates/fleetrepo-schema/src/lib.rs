//! Configuration, package and resource data model for fleetrepo.
//!
//! This crate defines the schema layer: TOML config parsing (`RepoConfig`),
//! resolved `Distribution`s, Debian filename parsing and version ordering for
//! `PackageFile`s, and the tagged `Resource` model shared between the catalog
//! and every fleet node.

pub mod config;
pub mod index;
pub mod package;
pub mod resource;
pub mod types;
pub mod version;

pub use config::{
    parse_config_file, parse_config_str, AnnounceSection, CatalogSection, ConfigError,
    Distribution, DistributionSection, NodeSection, RepoConfig, RepositorySection,
    ScheduleSection, DEFAULT_CATALOG_TIMEOUT_SECS, DEFAULT_RELEASE,
};
pub use index::{IndexGroup, PackageIndex};
pub use package::{
    index_order, package_path, parse_package_filename, PackageError, PackageFile, PackageName,
};
pub use resource::{
    parse_tags, DnsAddress, FleetNode, RepositorySource, Resource, ResourceError, ResourceId,
    ResourceKind, ResourcePayload,
};
pub use types::{validate_name, Checksum, InvalidName, KeyId, NodeId, SnapshotId};
pub use version::{compare_versions, is_valid_version};
