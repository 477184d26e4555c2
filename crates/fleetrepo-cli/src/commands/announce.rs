use super::{colorize_status, json_pretty, EXIT_PARTIAL, EXIT_SUCCESS};
use fleetrepo_catalog::DeclareOutcome;
use fleetrepo_core::ReconcileJob;
use fleetrepo_schema::RepoConfig;

pub fn run(config: RepoConfig, json: bool) -> Result<u8, String> {
    let job = ReconcileJob::new(config).map_err(|e| e.to_string())?;
    let announced = job.announce().map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&announced)?);
    } else if announced.declared.is_empty() && announced.failed.is_empty() {
        println!("nothing to announce: no [announce] section");
    } else {
        for (id, outcome) in &announced.declared {
            let word = match outcome {
                DeclareOutcome::Declared => "declared",
                DeclareOutcome::Stale => "stale",
            };
            println!("{id} {}", colorize_status(word));
        }
        for (id, reason) in &announced.failed {
            println!("{id} {}: {reason}", colorize_status("failed"));
        }
    }

    if announced.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_PARTIAL)
    }
}
