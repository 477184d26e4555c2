use super::{
    colorize_status, json_pretty, layout, spin_fail, spin_ok, spinner, EXIT_PARTIAL, EXIT_SUCCESS,
};
use fleetrepo_core::{CompileJob, StoreLock};
use fleetrepo_schema::RepoConfig;

pub fn run(config: RepoConfig, dists: &[String], json: bool) -> Result<u8, String> {
    let layout = layout(&config);
    let _lock = StoreLock::try_acquire_or_fail(&layout.lock_file())
        .map_err(|e| format!("store lock: {e}"))?;

    let pb = if json {
        None
    } else {
        Some(spinner("compiling repository..."))
    };
    let reports = match CompileJob::new(config).compile(dists) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "compile finished");
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "compile failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&reports)?);
    } else {
        for r in &reports {
            let state = if r.unchanged { "unchanged" } else { "live" };
            println!(
                "{}: {} {} ({} packages, {} accepted, {} duplicates, {} rejected)",
                r.distribution,
                r.snapshot_id,
                colorize_status(state),
                r.package_count,
                r.accepted.len(),
                r.duplicates.len(),
                r.rejected.len(),
            );
            for rej in &r.rejected {
                println!(
                    "  {} {}: {}",
                    colorize_status("rejected"),
                    rej.filename,
                    rej.reason
                );
            }
        }
    }

    if reports.iter().all(fleetrepo_core::CompileReport::is_clean) {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_PARTIAL)
    }
}
