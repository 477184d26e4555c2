use super::{json_pretty, EXIT_SUCCESS};
use fleetrepo_core::{export_public_key, Keyring};
use fleetrepo_schema::RepoConfig;

pub fn run(config: &RepoConfig, json: bool) -> Result<u8, String> {
    let keyring = Keyring::new(config.keyring_dir());
    let (path, changed) = export_public_key(config, &keyring).map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({ "path": path, "changed": changed });
        println!("{}", json_pretty(&payload)?);
    } else if changed {
        println!("exported public key to {}", path.display());
    } else {
        println!("public key at {} is up to date", path.display());
    }
    Ok(EXIT_SUCCESS)
}
