//! The publisher serving a real compiled repository, and the HTTP catalog
//! client talking to its `/_catalog` routes. No mocks.

use fleetrepo_catalog::{
    CatalogBackend, CatalogCompiler, CatalogError, DeclareOutcome, HttpCatalog, NodePaths,
    RetractOutcome,
};
use fleetrepo_core::{CompileJob, Keyring};
use fleetrepo_schema::{
    parse_config_str, parse_tags, DnsAddress, FleetNode, KeyId, NodeId, RepoConfig,
    RepositorySource, Resource, ResourceKind, ResourcePayload,
};
use fleetrepo_server::TestServer;
use fleetrepo_store::sha256_bytes;
use std::fs;
use std::path::Path;

fn agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into()
}

fn repo_config(root: &Path) -> RepoConfig {
    let config = parse_config_str(&format!(
        r#"
[repository]
name = "localpkgs"
basedir = "{root}/repo"
domain = "apt.example.com"
key_id = "repo-2024"

[[distribution]]
name = "stable"
architectures = ["amd64"]
components = ["main"]
"#,
        root = root.display()
    ))
    .unwrap();
    Keyring::new(config.keyring_dir())
        .generate(&KeyId::new("repo-2024"), None)
        .unwrap();
    config
}

/// A compiled repository with one package, served with a catalog.
fn start() -> (tempfile::TempDir, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    let job = CompileJob::new(repo_config(dir.path()));
    let intake = job.layout().intake_dir("stable");
    fs::create_dir_all(&intake).unwrap();
    fs::write(intake.join("hello_1.0_amd64.deb"), b"hello deb").unwrap();
    fs::write(
        intake.join("hello_1.0_amd64.deb.sha256"),
        sha256_bytes(b"hello deb").to_string(),
    )
    .unwrap();
    job.compile(&[]).unwrap();

    let catalog = dir.path().join("catalog");
    fs::create_dir_all(&catalog).unwrap();
    let server = TestServer::start(
        job.layout().docroot(),
        Some(catalog),
        dir.path().join("access.log"),
    )
    .unwrap();
    (dir, server)
}

fn address(node: &str, ip: &str) -> Resource {
    Resource::new(
        "apt.example.com",
        parse_tags("fleet-a"),
        NodeId::new(node),
        ResourcePayload::DnsAddress(DnsAddress {
            hostname: "apt.example.com".to_owned(),
            ip: ip.to_owned(),
        }),
    )
}

#[test]
fn serves_published_files_with_content_types() {
    let (_dir, server) = start();
    let agent = agent();

    let mut resp = agent.get(&format!("{}/stable/Release", server.url)).call().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    let release = resp.body_mut().read_to_string().unwrap();
    assert!(release.starts_with("Origin: localpkgs\n"));

    let mut resp = agent
        .get(&format!("{}/stable/main/amd64/hello_1.0_amd64.deb", server.url))
        .call()
        .unwrap();
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/vnd.debian.binary-package"
    );
    assert_eq!(resp.body_mut().read_to_vec().unwrap(), b"hello deb");

    let mut resp = agent.get(&format!("{}/localpkgs.gpg", server.url)).call().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(!resp.body_mut().read_to_string().unwrap().trim().is_empty());

    let resp = agent.head(&format!("{}/stable/Release.sig", server.url)).call().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[test]
fn error_statuses() {
    let (_dir, server) = start();
    let agent = agent();
    let status = |url: &str| {
        let resp = agent.get(&format!("{}{url}", server.url)).call().unwrap();
        resp.status().as_u16()
    };

    assert_eq!(status("/stable/missing"), 404);
    assert_eq!(status("/stable/main"), 404);
    assert_eq!(status("/stable/%2e%2e/%2e%2e/snapshots"), 400);
    let post = agent
        .post(&format!("{}/stable/Release", server.url))
        .send_empty()
        .unwrap();
    assert_eq!(post.status().as_u16(), 405);

    let mut health = agent.get(&format!("{}/health", server.url)).call().unwrap();
    assert_eq!(health.body_mut().read_to_string().unwrap(), r#"{"status":"ok"}"#);
}

#[test]
fn every_request_is_logged_as_json() {
    let (_dir, server) = start();
    let agent = agent();
    agent
        .get(&format!("{}/stable/Release", server.url))
        .header("User-Agent", "Debian APT-HTTP/1.3")
        .call()
        .unwrap();
    agent.get(&format!("{}/nope", server.url)).call().unwrap();

    // The line is written after the response is sent.
    let mut lines = server.log_lines();
    for _ in 0..50 {
        if lines.len() >= 2 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        lines = server.log_lines();
    }
    assert_eq!(lines.len(), 2);
    let first = &lines[0];
    assert_eq!(first["@fields"]["status"], 200);
    assert_eq!(first["@fields"]["method"], "GET");
    assert_eq!(first["@fields"]["request_path"], "/stable/Release");
    assert_eq!(first["@fields"]["client"], "127.0.0.1");
    assert_eq!(first["@fields"]["user-agent"], "Debian APT-HTTP/1.3");
    assert_eq!(first["@fields"]["referrer"], "-");
    assert_eq!(
        first["@message"],
        "127.0.0.1 \"GET /stable/Release HTTP/1.1\" 200"
    );
    assert_eq!(lines[1]["@fields"]["status"], 404);
}

#[test]
fn catalog_routes_round_trip_through_http_client() {
    let (_dir, server) = start();
    let catalog = HttpCatalog::new(&server.url);

    let first = address("repo-01", "10.0.0.5");
    assert_eq!(catalog.declare(&first).unwrap(), DeclareOutcome::Declared);
    let mut older = address("repo-02", "10.0.0.6");
    older.declared_at = first.declared_at - chrono::Duration::seconds(10);
    assert_eq!(catalog.declare(&older).unwrap(), DeclareOutcome::Stale);

    let pulled = catalog.pull(&parse_tags("fleet-a,web")).unwrap();
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0], first);
    assert!(catalog.pull(&parse_tags("fleet-b")).unwrap().is_empty());
    assert_eq!(catalog.list().unwrap().len(), 1);

    let err = catalog
        .retract(ResourceKind::DnsAddress, "apt.example.com", &NodeId::new("web-01"))
        .unwrap_err();
    match err {
        CatalogError::NotOwner { owner, .. } => assert_eq!(owner.as_str(), "repo-01"),
        other => panic!("expected NotOwner, got {other}"),
    }
    let owner = NodeId::new("repo-01");
    assert_eq!(
        catalog.retract(ResourceKind::DnsAddress, "apt.example.com", &owner).unwrap(),
        RetractOutcome::Retracted
    );
    assert_eq!(
        catalog.retract(ResourceKind::DnsAddress, "apt.example.com", &owner).unwrap(),
        RetractOutcome::Missing
    );
}

#[test]
fn retract_against_wrong_base_path_is_not_missing() {
    let (_dir, server) = start();
    let catalog = HttpCatalog::new(&format!("{}/mirror", server.url));
    let result = catalog.retract(ResourceKind::DnsAddress, "apt.example.com", &NodeId::new("repo-01"));
    assert!(matches!(result, Err(CatalogError::Http(_))), "{result:?}");
}

#[test]
fn mismatched_catalog_put_is_rejected() {
    let (_dir, server) = start();
    let body = serde_json::to_vec(&address("repo-01", "10.0.0.5")).unwrap();
    let resp = agent()
        .put(&format!("{}/_catalog/dns_address/other.example.com", server.url))
        .header("Content-Type", "application/json")
        .send(&body[..])
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[test]
fn node_converges_from_http_catalog_and_fetches_key_over_http() {
    let (dir, server) = start();
    let catalog = HttpCatalog::new(&server.url);
    catalog
        .declare(&Resource::new(
            "localpkgs",
            parse_tags("fleet-a"),
            NodeId::new("repo-01"),
            ResourcePayload::RepositorySource(RepositorySource {
                location_url: format!("{}/", server.url),
                distribution: "stable".to_owned(),
                components: vec!["main".to_owned()],
                key_id: KeyId::new("repo-2024"),
                key_source_url: format!("{}/localpkgs.gpg", server.url),
                include_source: false,
            }),
        ))
        .unwrap();

    let node = dir.path().join("web-01");
    fs::create_dir_all(&node).unwrap();
    fs::write(node.join("hosts"), "127.0.0.1 localhost\n").unwrap();
    let paths = NodePaths {
        sources_dir: node.join("sources.list.d"),
        keyring_dir: node.join("keyrings"),
        hosts_file: node.join("hosts"),
        state_dir: node.join("state"),
    };
    let fleet = FleetNode {
        node_id: NodeId::new("web-01"),
        tags: parse_tags("fleet-a"),
    };
    let report = CatalogCompiler::new(&catalog, paths.clone())
        .reconcile(&fleet)
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.applied.len(), 1);

    let key = fs::read(paths.keyring_dir.join("fleetrepo-localpkgs.gpg")).unwrap();
    let published = fs::read(dir.path().join("repo/public/localpkgs.gpg")).unwrap();
    assert_eq!(key, published);
    let list = fs::read_to_string(paths.sources_dir.join("fleetrepo-localpkgs.list")).unwrap();
    assert!(list.contains(&format!("{}/ stable main", server.url)));
}
