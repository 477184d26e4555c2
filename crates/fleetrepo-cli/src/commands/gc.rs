use super::{json_pretty, layout, EXIT_SUCCESS};
use fleetrepo_core::StoreLock;
use fleetrepo_schema::RepoConfig;
use fleetrepo_store::GarbageCollector;

pub fn run(config: &RepoConfig, dry_run: bool, json: bool) -> Result<u8, String> {
    let layout = layout(config);
    let _lock = StoreLock::try_acquire_or_fail(&layout.lock_file())
        .map_err(|e| format!("store lock: {e}"))?;

    let report = GarbageCollector::new(layout)
        .collect(config.repository.keep_snapshots, dry_run)
        .map_err(|e| format!("store error: {e}"))?;
    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "report": report,
        });
        println!("{}", json_pretty(&payload)?);
    } else if dry_run {
        println!(
            "gc: would remove {} snapshots, {} staging dirs, {} packages",
            report.old_snapshots.len(),
            report.stale_staging.len(),
            report.orphaned_packages.len()
        );
        for s in &report.old_snapshots {
            println!("  snapshot {s}");
        }
    } else {
        println!(
            "gc: removed {} snapshots, {} staging dirs, {} packages",
            report.removed_snapshots, report.removed_staging, report.removed_packages
        );
    }
    Ok(EXIT_SUCCESS)
}
