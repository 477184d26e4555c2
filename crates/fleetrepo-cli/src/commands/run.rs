use super::{colorize_status, json_pretty, EXIT_FAILURE, EXIT_PARTIAL, EXIT_SUCCESS};
use fleetrepo_core::{shutdown_requested, JobStatus, Scheduler};
use fleetrepo_schema::RepoConfig;
use std::time::Instant;

/// Drive the scheduler until interrupted, or for a single tick with `once`.
pub fn run(config: &RepoConfig, once: bool, json: bool) -> Result<u8, String> {
    let mut scheduler = Scheduler::from_config(config, Instant::now()).map_err(|e| e.to_string())?;
    if !once {
        scheduler.run(shutdown_requested).map_err(|e| e.to_string())?;
        return Ok(EXIT_SUCCESS);
    }

    let report = scheduler.tick(Instant::now()).map_err(|e| e.to_string())?;
    if json {
        let jobs: Vec<_> = report
            .jobs
            .iter()
            .map(|(name, status)| {
                let mut entry = serde_json::to_value(status)?;
                entry["job"] = serde_json::Value::from(*name);
                Ok(entry)
            })
            .collect::<Result<_, serde_json::Error>>()
            .map_err(|e| format!("JSON serialization failed: {e}"))?;
        println!("{}", json_pretty(&jobs)?);
    } else {
        for (name, status) in &report.jobs {
            match status {
                JobStatus::Completed => println!("{name}: {}", colorize_status("ok")),
                JobStatus::Partial { problems } => {
                    println!("{name}: {}", colorize_status("partial"));
                    for problem in problems {
                        println!("  {problem}");
                    }
                }
                JobStatus::Skipped => println!("{name}: {}", colorize_status("skipped")),
                JobStatus::Failed { error } => {
                    println!("{name}: {} {error}", colorize_status("failed"));
                }
            }
        }
    }

    if report.any_failed() {
        Ok(EXIT_FAILURE)
    } else if report.any_partial() {
        Ok(EXIT_PARTIAL)
    } else {
        Ok(EXIT_SUCCESS)
    }
}
