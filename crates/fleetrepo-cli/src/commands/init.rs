use super::{json_pretty, layout, EXIT_SUCCESS};
use fleetrepo_schema::RepoConfig;

pub fn run(config: &RepoConfig, json: bool) -> Result<u8, String> {
    let layout = layout(config);
    let dists = config.distributions();
    layout
        .initialize(&dists)
        .map_err(|e| format!("store error: {e}"))?;
    std::fs::create_dir_all(config.keyring_dir())
        .map_err(|e| format!("failed to create keyring dir: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "basedir": layout.root(),
            "docroot": layout.docroot(),
            "distributions": dists.iter().map(|d| &d.name).collect::<Vec<_>>(),
            "intake": dists.iter().map(|d| layout.intake_dir(&d.name)).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("initialized repository at {}", layout.root().display());
        for d in &dists {
            println!("  intake {}: {}", d.name, layout.intake_dir(&d.name).display());
        }
    }
    Ok(EXIT_SUCCESS)
}
