use criterion::{criterion_group, criterion_main, Criterion};
use fleetrepo_core::{render_packages, render_release, Keyring, RepositoryCompiler};
use fleetrepo_schema::{Checksum, Distribution, KeyId, PackageFile};
use fleetrepo_store::{sha256_bytes, ReleaseEntry, RepoLayout};
use std::collections::BTreeSet;
use std::fs;

fn dist() -> Distribution {
    Distribution {
        name: "stable".to_owned(),
        origin: "Bench".to_owned(),
        label: "Bench".to_owned(),
        suite: "stable".to_owned(),
        architectures: BTreeSet::from(["amd64".to_owned(), "arm64".to_owned()]),
        components: vec!["main".to_owned()],
        description: String::new(),
        signing_key_id: KeyId::new("bench"),
        not_automatic: false,
        auto_promote: true,
    }
}

fn packages(n: usize) -> Vec<PackageFile> {
    (0..n)
        .map(|i| PackageFile {
            name: format!("pkg{i:05}"),
            version: format!("1.{i}-1"),
            architecture: "amd64".to_owned(),
            component: "main".to_owned(),
            distribution: "stable".to_owned(),
            path: format!("stable/main/amd64/pkg{i:05}_1.{i}-1_amd64.deb"),
            size: 4096 + i as u64,
            checksum: Checksum::new(format!("{i:064x}")),
        })
        .collect()
}

fn bench_render_packages(c: &mut Criterion) {
    let pkgs = packages(5000);
    c.bench_function("render_packages_5000", |b| {
        b.iter(|| render_packages(&pkgs));
    });
}

fn bench_render_release(c: &mut Criterion) {
    let entries: Vec<ReleaseEntry> = (0..64)
        .map(|i| ReleaseEntry {
            checksum: sha256_bytes(format!("{i}").as_bytes()),
            size: i,
            path: format!("comp{i}/amd64/Packages"),
        })
        .collect();
    let d = dist();
    let date = chrono::Utc::now();
    c.bench_function("render_release_64_indexes", |b| {
        b.iter(|| render_release(&d, date, &entries));
    });
}

fn bench_compile_unchanged(c: &mut Criterion) {
    c.bench_function("compile_unchanged_100pkg", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let keyring = Keyring::new(dir.path().join("keys"));
                keyring.generate(&KeyId::new("bench"), None).unwrap();
                let layout = RepoLayout::new(dir.path().join("repo"));
                let intake = layout.intake_dir("stable");
                fs::create_dir_all(&intake).unwrap();
                for i in 0..100 {
                    let name = format!("pkg{i}_1.0_amd64.deb");
                    let data = format!("package {i}");
                    fs::write(intake.join(&name), &data).unwrap();
                    fs::write(
                        intake.join(format!("{name}.sha256")),
                        sha256_bytes(data.as_bytes()).to_string(),
                    )
                    .unwrap();
                }
                RepositoryCompiler::new(layout.clone(), &keyring, 3)
                    .compile(&dist())
                    .unwrap();
                (dir, keyring, layout)
            },
            |(_dir, keyring, layout)| {
                RepositoryCompiler::new(layout, &keyring, 3)
                    .compile(&dist())
                    .unwrap();
            },
        );
    });
}

criterion_group!(
    benches,
    bench_render_packages,
    bench_render_release,
    bench_compile_unchanged
);
criterion_main!(benches);
