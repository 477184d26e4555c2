//! Intake to published, signed and verified repository, driven from a
//! config file the way `fleetrepo` drives it.

use fleetrepo_catalog::{CatalogBackend, FileCatalog};
use fleetrepo_core::{
    verify_distribution, CompileJob, JobStatus, Keyring, ReconcileJob, RejectionReason,
    Scheduler, SigningService, StoreLock,
};
use fleetrepo_schema::{
    parse_config_str, parse_tags, DnsAddress, KeyId, NodeId, RepoConfig, Resource,
    ResourcePayload,
};
use fleetrepo_store::{sha256_bytes, GarbageCollector, PackagePool, RepoLayout, SnapshotStore};
use std::fs;
use std::path::Path;
use std::time::Instant;

fn config(root: &Path, extra: &str) -> RepoConfig {
    let text = format!(
        r#"
[repository]
name = "localpkgs"
basedir = "{root}/repo"
keyring = "{root}/keys"
domain = "localhost:1"
key_id = "repo-2024"
keep_snapshots = 2

[[distribution]]
name = "stable"
architectures = ["amd64", "arm64"]
components = ["main", "contrib"]

[[distribution]]
name = "testing"
architectures = ["amd64"]
components = ["main"]
not_automatic = true
{extra}
"#,
        root = root.display()
    );
    let config = parse_config_str(&text).unwrap();
    Keyring::new(config.keyring_dir())
        .generate(&KeyId::new("repo-2024"), None)
        .unwrap();
    config
}

fn drop_package(layout: &RepoLayout, dist: &str, rel: &str, content: &[u8]) {
    let path = layout.intake_dir(dist).join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    let name = path.file_name().unwrap().to_str().unwrap().to_owned();
    fs::write(
        path.with_file_name(format!("{name}.sha256")),
        format!("{}  {name}\n", sha256_bytes(content)),
    )
    .unwrap();
}

#[test]
fn compile_all_publishes_every_distribution_and_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let job = CompileJob::new(config(dir.path(), ""));
    let layout = job.layout();
    drop_package(&layout, "stable", "hello_1.0-1_amd64.deb", b"hello");
    drop_package(&layout, "testing", "hello_1.1-1_amd64.deb", b"hello 1.1");

    let reports = job.compile(&[]).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.accepted.len() == 1));

    let docroot = layout.docroot();
    let testing = fs::read_to_string(docroot.join("testing/Release")).unwrap();
    assert!(testing.contains("NotAutomatic: yes\nButAutomaticUpgrades: yes\n"));
    let key = fs::read_to_string(docroot.join("localpkgs.gpg")).unwrap();
    let keyring = Keyring::new(dir.path().join("keys"));
    assert_eq!(key.trim(), keyring.public_key(&KeyId::new("repo-2024")).unwrap());
}

#[test]
fn verify_catches_tampered_package_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), "");
    let job = CompileJob::new(cfg.clone());
    let layout = job.layout();
    drop_package(&layout, "stable", "hello_1.0_amd64.deb", b"hello");
    job.compile(&["stable".to_owned()]).unwrap();

    let keyring = Keyring::new(cfg.keyring_dir());
    let key_id = KeyId::new("repo-2024");
    let docroot = layout.docroot();
    let clean = verify_distribution(&docroot, "stable", &keyring, &key_id).unwrap();
    assert!(clean.is_clean());
    assert_eq!(clean.checked, 1);

    // The published file is a hard link into the pool; replace it instead of
    // writing through it.
    let pkg = docroot.join("stable/main/amd64/hello_1.0_amd64.deb");
    fs::remove_file(&pkg).unwrap();
    fs::write(&pkg, b"evil").unwrap();
    let report = verify_distribution(&docroot, "stable", &keyring, &key_id).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].key, "stable/main/amd64/hello_1.0_amd64.deb");
    assert_eq!(report.signatures_passed, 1);

    let release = docroot.join("stable/Release");
    let mut text = fs::read_to_string(&release).unwrap();
    text.push_str("Extra: field\n");
    fs::remove_file(&release).unwrap();
    fs::write(&release, text).unwrap();
    let report = verify_distribution(&docroot, "stable", &keyring, &key_id).unwrap();
    assert!(report.failed.iter().any(|f| f.key == "stable/Release.sig"));
    assert_eq!(report.signatures_passed, 0);
}

#[test]
fn arch_all_packages_survive_architecture_changes() {
    let dir = tempfile::tempdir().unwrap();
    let job = CompileJob::new(config(dir.path(), ""));
    let layout = job.layout();
    drop_package(&layout, "stable", "contrib/docs_1.0_all.deb", b"docs");
    drop_package(&layout, "stable", "contrib/tool_1.0_arm64.deb", b"tool");
    job.compile(&["stable".to_owned()]).unwrap();

    // Drop arm64 from the distribution.
    let mut narrowed = config_without_keygen(dir.path());
    narrowed.distributions[0].architectures = vec!["amd64".to_owned()];
    let reports = CompileJob::new(narrowed).compile(&["stable".to_owned()]).unwrap();
    assert!(!reports[0].unchanged);
    assert_eq!(reports[0].package_count, 1);

    let live = layout.published_link("stable");
    let amd64 = fs::read_to_string(live.join("contrib/amd64/Packages")).unwrap();
    assert!(amd64.contains("Package: docs"));
    assert!(!live.join("contrib/arm64").exists());
}

fn config_without_keygen(root: &Path) -> RepoConfig {
    let text = format!(
        r#"
[repository]
name = "localpkgs"
basedir = "{root}/repo"
keyring = "{root}/keys"
domain = "localhost:1"
key_id = "repo-2024"

[[distribution]]
name = "stable"
architectures = ["amd64", "arm64"]
components = ["main", "contrib"]
"#,
        root = root.display()
    );
    parse_config_str(&text).unwrap()
}

#[test]
fn gc_reclaims_packages_of_pruned_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let job = CompileJob::new(config(dir.path(), ""));
    let layout = job.layout();
    for i in 0..4 {
        let name = format!("p{i}_1.0_amd64.deb");
        drop_package(&layout, "stable", &name, name.as_bytes());
        job.compile(&["stable".to_owned()]).unwrap();
    }
    let store = SnapshotStore::new(layout.clone());
    assert_eq!(store.list("stable").unwrap().len(), 2);

    // Every package is still in the live index, so nothing is orphaned.
    let report = GarbageCollector::new(layout.clone()).collect(2, false).unwrap();
    assert!(report.orphaned_packages.is_empty());
    assert_eq!(PackagePool::new(layout).list().unwrap().len(), 4);
}

#[test]
fn rejected_files_do_not_block_good_ones() {
    let dir = tempfile::tempdir().unwrap();
    let job = CompileJob::new(config(dir.path(), ""));
    let layout = job.layout();
    drop_package(&layout, "stable", "good_1.0_amd64.deb", b"good");
    let bad = layout.intake_dir("stable").join("bad_1.0_amd64.deb");
    fs::write(&bad, b"bad").unwrap();
    fs::write(bad.with_file_name("bad_1.0_amd64.deb.sha256"), "f".repeat(64)).unwrap();

    let reports = job.compile(&["stable".to_owned()]).unwrap();
    assert_eq!(reports[0].accepted.len(), 1);
    assert!(matches!(
        reports[0].rejected[0].reason,
        RejectionReason::ChecksumMismatch { .. }
    ));
    assert!(!bad.exists());
    assert!(layout.quarantine_dir("stable").join("bad_1.0_amd64.deb").exists());
}

#[test]
fn scheduler_skips_compile_while_repository_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), "");
    let layout = RepoLayout::new(&cfg.repository.basedir);
    let mut scheduler = Scheduler::from_config(&cfg, Instant::now()).unwrap();

    let held = StoreLock::acquire(&layout.lock_file()).unwrap();
    let report = scheduler.tick(Instant::now()).unwrap();
    assert_eq!(report.jobs, vec![("compile", JobStatus::Skipped)]);
    drop(held);

    // Rescheduled for the next interval, not retried immediately.
    assert!(scheduler.tick(Instant::now()).unwrap().jobs.is_empty());
}

#[test]
fn scheduler_announces_and_reconciles_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("catalog")).unwrap();
    fs::write(root.join("hosts"), "127.0.0.1 localhost\n").unwrap();
    let node = format!(
        r#"
[node]
id = "repo-01"
tags = ["fleet-a"]
catalog = "{root}/catalog"
sources_dir = "{root}/sources.list.d"
keyring_dir = "{root}/keyrings"
hosts_file = "{root}/hosts"
state_dir = "{root}/state"

[announce]
tags = ["fleet-a"]
ip = "10.0.0.5"
"#,
        root = root.display()
    );
    let cfg = config(root, &node);
    let mut scheduler = Scheduler::from_config(&cfg, Instant::now()).unwrap();

    let report = scheduler.tick(Instant::now()).unwrap();
    assert_eq!(report.jobs[0], ("compile", JobStatus::Completed));
    // The announced key URL is unreachable, so the source cannot apply.
    match &report.jobs[1] {
        ("reconcile", JobStatus::Partial { problems }) => {
            assert_eq!(problems.len(), 1);
            assert!(problems[0].starts_with("apply repository_source/localpkgs"));
        }
        other => panic!("expected a partial reconcile, got {other:?}"),
    }
    assert!(root.join("catalog/repository_source/localpkgs.json").exists());
    assert!(root.join("catalog/dns_address/localhost.json").exists());
    // Nothing serves http://localhost:1, so only the address applies.
    let hosts = fs::read_to_string(root.join("hosts")).unwrap();
    assert!(hosts.contains("10.0.0.5 localhost"));
    assert!(!root.join("sources.list.d/fleetrepo-localpkgs.list").exists());
}

#[test]
fn bad_announce_entry_does_not_block_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("catalog")).unwrap();
    fs::write(root.join("hosts"), "127.0.0.1 localhost\n").unwrap();
    let node = format!(
        r#"
[node]
id = "repo-01"
tags = ["fleet-a"]
catalog = "{root}/catalog"
sources_dir = "{root}/sources.list.d"
keyring_dir = "{root}/keyrings"
hosts_file = "{root}/hosts"
state_dir = "{root}/state"
"#,
        root = root.display()
    );
    let mut cfg = config(root, &node);
    // Parsing refuses a bad address, so inject it the way a stale in-memory
    // config would carry it.
    cfg.announce = Some(fleetrepo_schema::AnnounceSection {
        tags: parse_tags("fleet-a"),
        ip: Some("not-an-ip".to_owned()),
        distribution: Some("nope".to_owned()),
        include_source: false,
    });

    FileCatalog::new(root.join("catalog"))
        .declare(&Resource::new(
            "db.example.com",
            parse_tags("fleet-a"),
            NodeId::new("db-01"),
            ResourcePayload::DnsAddress(DnsAddress {
                hostname: "db.example.com".to_owned(),
                ip: "10.0.0.9".to_owned(),
            }),
        ))
        .unwrap();

    let run = ReconcileJob::new(cfg).unwrap().run_once().unwrap();
    assert!(run.announced.is_empty());
    assert_eq!(run.announce_failed.len(), 2);
    assert_eq!(run.report.applied.len(), 1);
    assert!(!run.is_clean());
    assert!(run.problems().iter().all(|p| p.starts_with("announce ")));

    let hosts = fs::read_to_string(root.join("hosts")).unwrap();
    assert!(hosts.contains("10.0.0.9 db.example.com"));
}

#[test]
fn verify_sees_one_snapshot_while_compiles_publish() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "");
    // No pruning, so every snapshot a reader resolved stays on disk.
    cfg.repository.keep_snapshots = 100;
    let job = CompileJob::new(cfg.clone());
    let layout = job.layout();
    drop_package(&layout, "stable", "p0_1.0_amd64.deb", b"p0");
    job.compile(&["stable".to_owned()]).unwrap();

    let writer = {
        let layout = layout.clone();
        std::thread::spawn(move || {
            for i in 1..40 {
                let name = format!("p{i}_1.0_amd64.deb");
                drop_package(&layout, "stable", &name, name.as_bytes());
                job.compile(&["stable".to_owned()]).unwrap();
            }
        })
    };

    let keyring = Keyring::new(cfg.keyring_dir());
    let key_id = KeyId::new("repo-2024");
    let docroot = layout.docroot();
    loop {
        let done = writer.is_finished();
        let report = verify_distribution(&docroot, "stable", &keyring, &key_id).unwrap();
        assert!(report.is_clean(), "{:?}", report.failed);
        assert_eq!(report.signatures_passed, 1);
        if done {
            break;
        }
    }
    writer.join().unwrap();

    let report = verify_distribution(&docroot, "stable", &keyring, &key_id).unwrap();
    assert_eq!(report.checked, 40);
}
