use super::{catalog, colorize_status, json_pretty, node_section, EXIT_SUCCESS};
use fleetrepo_catalog::RetractOutcome;
use fleetrepo_schema::{RepoConfig, ResourceId, ResourceKind};

pub fn run(
    config: &RepoConfig,
    location: Option<&str>,
    kind: &str,
    name: &str,
    json: bool,
) -> Result<u8, String> {
    let kind: ResourceKind = kind.parse().map_err(|e: fleetrepo_schema::ResourceError| e.to_string())?;
    let node = node_section(config)?;
    let backend = catalog(config, location)?;
    let outcome = backend
        .retract(kind, name, &node.id)
        .map_err(|e| e.to_string())?;

    let id = ResourceId::new(kind, name);
    if json {
        let payload = serde_json::json!({ "id": id, "outcome": outcome });
        println!("{}", json_pretty(&payload)?);
    } else {
        let word = match outcome {
            RetractOutcome::Retracted => "retracted",
            RetractOutcome::Missing => "missing",
        };
        println!("{id} {}", colorize_status(word));
    }
    Ok(EXIT_SUCCESS)
}
