use super::{colorize_status, json_pretty, layout, EXIT_STORE_ERROR, EXIT_SUCCESS};
use fleetrepo_core::{verify_distribution, Keyring, StoreLock};
use fleetrepo_schema::RepoConfig;
use fleetrepo_store::{verify_store, IntegrityReport};

fn print_failures(report: &IntegrityReport) {
    for f in &report.failed {
        println!("  {} {}: {}", colorize_status("FAIL"), f.key, f.reason);
    }
}

/// Verify the published trees and, with `store`, the pool and snapshot
/// records behind them.
pub fn run(config: &RepoConfig, dist: Option<&str>, store: bool, json: bool) -> Result<u8, String> {
    let targets = match dist {
        Some(name) => vec![config.distribution(name).map_err(|e| e.to_string())?],
        None => config.distributions(),
    };
    let layout = layout(config);
    let docroot = layout.docroot();
    let keyring = Keyring::new(config.keyring_dir());
    let _lock =
        StoreLock::acquire_shared(&layout.lock_file()).map_err(|e| format!("store lock: {e}"))?;

    let mut clean = true;
    let mut reports = Vec::new();
    for d in &targets {
        let report = verify_distribution(&docroot, &d.name, &keyring, &d.signing_key_id)
            .map_err(|e| e.to_string())?;
        clean &= report.is_clean();
        if !json {
            println!(
                "{}: {}/{} packages, {}/{} indexes, {}/{} signatures passed",
                d.name,
                report.passed,
                report.checked,
                report.indexes_passed,
                report.indexes_checked,
                report.signatures_passed,
                report.signatures_checked,
            );
            print_failures(&report);
        }
        reports.push(serde_json::json!({
            "distribution": d.name,
            "report": report,
        }));
    }

    if store {
        let names: Vec<&str> = targets.iter().map(|d| d.name.as_str()).collect();
        let report = verify_store(&layout, &names).map_err(|e| format!("store error: {e}"))?;
        clean &= report.is_clean();
        if !json {
            println!(
                "store: {}/{} pool files, {}/{} snapshot records passed",
                report.passed, report.checked, report.snapshots_passed, report.snapshots_checked,
            );
            print_failures(&report);
        }
        reports.push(serde_json::json!({
            "store": true,
            "report": report,
        }));
    }

    if json {
        println!("{}", json_pretty(&reports)?);
    }
    if clean {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
