use super::{json_pretty, EXIT_SUCCESS};
use fleetrepo_core::Keyring;
use fleetrepo_schema::{KeyId, RepoConfig};

pub fn run(
    config: &RepoConfig,
    key_id: Option<&str>,
    expires_days: Option<u32>,
    json: bool,
) -> Result<u8, String> {
    let key_id = key_id.map_or_else(|| config.repository.key_id.clone(), KeyId::new);
    let keyring = Keyring::new(config.keyring_dir());
    let record = keyring
        .generate(&key_id, expires_days)
        .map_err(|e| format!("signing error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "key_id": record.key_id,
            "public": record.public,
            "created_at": record.created_at,
            "expires_at": record.expires_at,
            "keyring": keyring.dir(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("generated key {} in {}", record.key_id, keyring.dir().display());
        println!("public: {}", record.public);
        if let Some(at) = record.expires_at {
            println!("expires: {}", at.format("%Y-%m-%d"));
        }
    }
    Ok(EXIT_SUCCESS)
}
