use super::{colorize_status, json_pretty, layout, EXIT_SUCCESS};
use fleetrepo_schema::RepoConfig;
use fleetrepo_store::{scan_intake, Quarantine, SnapshotStore};

pub fn run(config: &RepoConfig, json: bool) -> Result<u8, String> {
    let layout = layout(config);
    let store = SnapshotStore::new(layout.clone());
    let quarantine = Quarantine::new(layout.clone());
    let store_err = |e: fleetrepo_store::StoreError| format!("store error: {e}");

    let mut rows = Vec::new();
    for dist in config.distributions() {
        let snapshots = store.list(&dist.name).map_err(store_err)?;
        let live = snapshots.iter().find(|s| s.live);
        let pending = scan_intake(&layout.intake_dir(&dist.name))
            .map_err(store_err)?
            .iter()
            .filter(|c| c.has_package_extension())
            .count();
        let quarantined = quarantine.list(&dist.name).map_err(store_err)?;
        rows.push(serde_json::json!({
            "distribution": dist.name,
            "live": live.map(|s| s.snapshot_id.as_str()),
            "generated_at": live.map(|s| s.generated_at),
            "package_count": live.map_or(0, |s| s.package_count),
            "snapshots": snapshots.len(),
            "pending": pending,
            "quarantined": quarantined,
        }));

        if !json {
            match live {
                Some(s) => println!(
                    "{}: {} {} ({} packages, generated {})",
                    dist.name,
                    colorize_status("live"),
                    s.snapshot_id,
                    s.package_count,
                    s.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                ),
                None => println!("{}: not published", dist.name),
            }
            println!(
                "  {} snapshot(s), {pending} pending, {} quarantined",
                snapshots.len(),
                quarantined.len()
            );
            for q in &quarantined {
                println!("  {} {}: {}", colorize_status("rejected"), q.filename, q.reason);
            }
        }
    }

    if json {
        println!("{}", json_pretty(&rows)?);
    }
    Ok(EXIT_SUCCESS)
}
