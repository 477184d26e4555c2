use super::{colorize_status, json_pretty, node_section, EXIT_PARTIAL, EXIT_SUCCESS};
use fleetrepo_core::{ReconcileJob, StoreLock};
use fleetrepo_schema::RepoConfig;

pub fn run(config: RepoConfig, json: bool) -> Result<u8, String> {
    let lock_path = node_section(&config)?.state_dir.join(".lock");
    let _lock = StoreLock::try_acquire_or_fail(&lock_path).map_err(|e| format!("store lock: {e}"))?;

    let job = ReconcileJob::new(config).map_err(|e| e.to_string())?;
    let run = job.run_once().map_err(|e| e.to_string())?;
    let report = &run.report;

    if json {
        println!("{}", json_pretty(&run)?);
    } else {
        for (id, _) in &run.announced {
            println!("announced {id}");
        }
        for (id, reason) in &run.announce_failed {
            println!("{} to announce {id}: {reason}", colorize_status("failed"));
        }
        for id in &report.applied {
            println!("{} {id}", colorize_status("applied"));
        }
        for id in &report.removed {
            println!("removed {id}");
        }
        for (id, reason) in &report.failed {
            println!("{} {id}: {reason}", colorize_status("failed"));
        }
        println!(
            "reconcile: {} applied, {} unchanged, {} removed, {} failed",
            report.applied.len(),
            report.unchanged.len(),
            report.removed.len(),
            report.failed.len()
        );
    }

    if run.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_PARTIAL)
    }
}
