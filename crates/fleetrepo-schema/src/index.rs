use crate::package::{index_order, PackageFile};
use crate::types::Checksum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One `(component, architecture)` group as it is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGroup {
    pub component: String,
    pub architecture: String,
    pub packages: Vec<PackageFile>,
}

/// Package index of one distribution, grouped by `(component, architecture)`.
///
/// Group iteration order is lexical and [`sort`](Self::sort) puts each group in
/// canonical [`index_order`], so two indexes holding the same files compare
/// and serialize identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<IndexGroup>", into = "Vec<IndexGroup>")]
pub struct PackageIndex {
    groups: BTreeMap<(String, String), Vec<PackageFile>>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure an (possibly empty) group exists so it gets a `Packages` file.
    pub fn ensure_group(&mut self, component: &str, architecture: &str) {
        self.groups
            .entry((component.to_owned(), architecture.to_owned()))
            .or_default();
    }

    pub fn insert(&mut self, component: &str, architecture: &str, package: PackageFile) {
        self.groups
            .entry((component.to_owned(), architecture.to_owned()))
            .or_default()
            .push(package);
    }

    pub fn group(&self, component: &str, architecture: &str) -> Option<&[PackageFile]> {
        self.groups
            .get(&(component.to_owned(), architecture.to_owned()))
            .map(Vec::as_slice)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &str, &[PackageFile])> {
        self.groups
            .iter()
            .map(|((c, a), pkgs)| (c.as_str(), a.as_str(), pkgs.as_slice()))
    }

    pub fn contains_checksum(&self, component: &str, architecture: &str, checksum: &Checksum) -> bool {
        self.group(component, architecture)
            .is_some_and(|pkgs| pkgs.iter().any(|p| p.checksum == *checksum))
    }

    /// Find an indexed package with the same name, version and architecture.
    pub fn find_build(
        &self,
        component: &str,
        architecture: &str,
        candidate: &PackageFile,
    ) -> Option<&PackageFile> {
        self.group(component, architecture)?
            .iter()
            .find(|p| p.same_build(candidate))
    }

    pub fn sort(&mut self) {
        for pkgs in self.groups.values_mut() {
            pkgs.sort_by(index_order);
        }
    }

    pub fn package_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Every distinct package checksum referenced by the index.
    pub fn checksums(&self) -> BTreeSet<Checksum> {
        self.groups
            .values()
            .flatten()
            .map(|p| p.checksum.clone())
            .collect()
    }

    /// Distinct files, keyed by published path. `all` packages appear in
    /// several groups but are one file.
    pub fn files(&self) -> BTreeMap<&str, &PackageFile> {
        self.groups
            .values()
            .flatten()
            .map(|p| (p.path.as_str(), p))
            .collect()
    }
}

impl From<Vec<IndexGroup>> for PackageIndex {
    fn from(groups: Vec<IndexGroup>) -> Self {
        let mut index = PackageIndex::new();
        for g in groups {
            index.ensure_group(&g.component, &g.architecture);
            for p in g.packages {
                index.insert(&g.component, &g.architecture, p);
            }
        }
        index.sort();
        index
    }
}

impl From<PackageIndex> for Vec<IndexGroup> {
    fn from(index: PackageIndex) -> Self {
        index
            .groups
            .into_iter()
            .map(|((component, architecture), packages)| IndexGroup {
                component,
                architecture,
                packages,
            })
            .collect()
    }
}
