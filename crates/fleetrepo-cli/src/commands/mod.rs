pub mod announce;
pub mod compile;
pub mod completions;
pub mod declare;
pub mod export_key;
pub mod gc;
pub mod init;
pub mod keygen;
pub mod man_pages;
pub mod pull;
pub mod reconcile;
pub mod retract;
pub mod run;
pub mod status;
pub mod verify;

use fleetrepo_catalog::{open_catalog, CatalogBackend};
use fleetrepo_schema::{parse_config_file, NodeSection, RepoConfig};
use fleetrepo_store::RepoLayout;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_SIGNING_ERROR: u8 = 4;
/// The run finished, but some files were quarantined or some resources
/// failed to apply.
pub const EXIT_PARTIAL: u8 = 5;

/// Map an error message to the process exit code.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config")
        || msg.starts_with("failed to read config")
        || msg.starts_with("failed to parse config")
    {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:")
        || msg.starts_with("store I/O error")
        || msg.starts_with("store lock:")
    {
        EXIT_STORE_ERROR
    } else if msg.starts_with("signing error:") {
        EXIT_SIGNING_ERROR
    } else {
        EXIT_FAILURE
    }
}

pub fn load_config(path: &Path) -> Result<RepoConfig, String> {
    parse_config_file(path).map_err(|e| match e {
        fleetrepo_schema::ConfigError::Io(io) => {
            format!("failed to read config file {}: {io}", path.display())
        }
        other => other.to_string(),
    })
}

pub fn layout(config: &RepoConfig) -> RepoLayout {
    RepoLayout::new(&config.repository.basedir)
}

pub fn node_section(config: &RepoConfig) -> Result<&NodeSection, String> {
    config.node().map_err(|e| e.to_string())
}

/// The catalog from `--catalog`, falling back to `[node] catalog`.
pub fn catalog(
    config: &RepoConfig,
    location: Option<&str>,
) -> Result<Box<dyn CatalogBackend>, String> {
    let location = match location {
        Some(l) => l.to_owned(),
        None => node_section(config)?.catalog.clone(),
    };
    open_catalog(&location, config.catalog.timeout()).map_err(|e| e.to_string())
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "ok" | "live" | "declared" | "retracted" | "applied" => {
            Style::new().green().apply_to(status).to_string()
        }
        "unchanged" => Style::new().dim().apply_to(status).to_string(),
        "stale" | "missing" | "skipped" | "partial" => Style::new().yellow().apply_to(status).to_string(),
        "FAIL" | "rejected" | "failed" => Style::new().red().bold().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}
