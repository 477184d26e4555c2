//! Resources a repository host exports about itself.

use fleetrepo_schema::{
    DnsAddress, NodeId, RepoConfig, RepositorySource, Resource, ResourceId, ResourceKind,
    ResourcePayload,
};
use tracing::warn;

/// The exports built from `[announce]`.
#[derive(Debug, Default)]
pub struct Announcement {
    pub resources: Vec<Resource>,
    /// Declarations that could not be built, with the reason. The rest are
    /// still exported.
    pub failed: Vec<(ResourceId, String)>,
}

impl Announcement {
    fn push(&mut self, resource: Resource) {
        match resource.validate() {
            Ok(()) => self.resources.push(resource),
            Err(e) => self.fail(resource.id(), e.to_string()),
        }
    }

    fn fail(&mut self, id: ResourceId, reason: String) {
        warn!("not announcing {id}: {reason}");
        self.failed.push((id, reason));
    }
}

/// Build the resources described by the `[announce]` section: a
/// `repository_source` named after the repository and, when an address is
/// configured, a `dns_address` for the repository domain. Without an
/// `[announce]` section nothing is exported.
pub fn announce_resources(config: &RepoConfig, node: &NodeId) -> Announcement {
    let mut out = Announcement::default();
    let Some(announce) = &config.announce else {
        return out;
    };
    let repo = &config.repository;
    let domain = repo.domain.trim_end_matches('/');
    let dist_name = announce.distribution.as_deref().unwrap_or(&repo.release);
    match config.distribution(dist_name) {
        Ok(dist) => out.push(Resource::new(
            repo.name.clone(),
            announce.tags.clone(),
            node.clone(),
            ResourcePayload::RepositorySource(RepositorySource {
                location_url: format!("http://{domain}/"),
                distribution: dist.name.clone(),
                components: dist.components.clone(),
                key_id: dist.signing_key_id.clone(),
                key_source_url: format!("http://{domain}/{}.gpg", repo.name),
                include_source: announce.include_source,
            }),
        )),
        Err(e) => out.fail(
            ResourceId::new(ResourceKind::RepositorySource, repo.name.clone()),
            e.to_string(),
        ),
    }

    if let Some(ip) = &announce.ip {
        let hostname = repo.announced_hostname();
        out.push(Resource::new(
            hostname,
            announce.tags.clone(),
            node.clone(),
            ResourcePayload::DnsAddress(DnsAddress {
                hostname: hostname.to_owned(),
                ip: ip.clone(),
            }),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetrepo_schema::parse_config_str;

    const BASE: &str = r#"
[repository]
name = "localpkgs"
basedir = "/srv/repo"
domain = "apt.example.com"
key_id = "repo-2024"

[[distribution]]
name = "stable"
architectures = ["amd64"]
components = ["main", "contrib"]
"#;

    #[test]
    fn no_announce_section_exports_nothing() {
        let config = parse_config_str(BASE).unwrap();
        let out = announce_resources(&config, &NodeId::new("repo-01"));
        assert!(out.resources.is_empty());
        assert!(out.failed.is_empty());
    }

    #[test]
    fn exports_source_and_address() {
        let doc = format!("{BASE}\n[announce]\ntags = [\"fleet-a\"]\nip = \"10.0.0.5\"\n");
        let config = parse_config_str(&doc).unwrap();
        let out = announce_resources(&config, &NodeId::new("repo-01"));
        assert!(out.failed.is_empty());
        let out = out.resources;
        assert_eq!(out.len(), 2);

        let src = &out[0];
        assert_eq!(src.kind(), ResourceKind::RepositorySource);
        assert_eq!(src.name, "localpkgs");
        let ResourcePayload::RepositorySource(payload) = &src.payload else {
            panic!("expected repository source");
        };
        assert_eq!(payload.location_url, "http://apt.example.com/");
        assert_eq!(payload.key_source_url, "http://apt.example.com/localpkgs.gpg");
        assert_eq!(payload.components, vec!["main", "contrib"]);
        assert_eq!(payload.distribution, "stable");
        assert_eq!(payload.key_id.as_str(), "repo-2024");

        let dns = &out[1];
        assert_eq!(dns.id().to_string(), "dns_address/apt.example.com");
        assert!(dns.tags.contains("fleet-a"));
        assert_eq!(dns.declared_by.as_str(), "repo-01");
    }

    #[test]
    fn port_is_kept_in_url_but_not_hostname() {
        let doc = BASE.replace("apt.example.com", "apt.example.com:8080")
            + "\n[announce]\ntags = [\"t\"]\nip = \"10.0.0.5\"\n";
        let config = parse_config_str(&doc).unwrap();
        let out = announce_resources(&config, &NodeId::new("repo-01")).resources;
        let ResourcePayload::RepositorySource(payload) = &out[0].payload else {
            panic!("expected repository source");
        };
        assert_eq!(payload.location_url, "http://apt.example.com:8080/");
        assert_eq!(out[1].name, "apt.example.com");
    }

    #[test]
    fn bad_ip_is_skipped_and_recorded() {
        // Parsing rejects this, so build the section by hand as a caller
        // holding an unvalidated config would.
        let mut config = parse_config_str(BASE).unwrap();
        config.announce = Some(fleetrepo_schema::AnnounceSection {
            tags: fleetrepo_schema::parse_tags("fleet-a"),
            ip: Some("not-an-ip".to_owned()),
            ..Default::default()
        });
        let out = announce_resources(&config, &NodeId::new("repo-01"));

        assert_eq!(out.resources.len(), 1);
        assert_eq!(out.resources[0].kind(), ResourceKind::RepositorySource);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].0.to_string(), "dns_address/apt.example.com");
        assert!(out.failed[0].1.contains("not-an-ip"));
    }

    #[test]
    fn unknown_distribution_only_drops_the_source() {
        let mut config = parse_config_str(BASE).unwrap();
        config.announce = Some(fleetrepo_schema::AnnounceSection {
            tags: fleetrepo_schema::parse_tags("fleet-a"),
            ip: Some("10.0.0.5".to_owned()),
            distribution: Some("gone".to_owned()),
            include_source: false,
        });
        let out = announce_resources(&config, &NodeId::new("repo-01"));

        assert_eq!(out.resources.len(), 1);
        assert_eq!(out.resources[0].kind(), ResourceKind::DnsAddress);
        assert_eq!(out.failed[0].0.to_string(), "repository_source/localpkgs");
    }
}
