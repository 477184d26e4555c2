use super::{catalog, json_pretty, node_section, EXIT_SUCCESS};
use fleetrepo_schema::{parse_tags, RepoConfig, ResourcePayload};

pub fn run(
    config: &RepoConfig,
    location: Option<&str>,
    tags: Option<&str>,
    json: bool,
) -> Result<u8, String> {
    let tags = match tags {
        Some(t) => parse_tags(t),
        None => node_section(config)?.tags.clone(),
    };
    let backend = catalog(config, location)?;
    let mut resources = backend.pull(&tags).map_err(|e| e.to_string())?;
    resources.sort_by_key(fleetrepo_schema::Resource::id);

    if json {
        println!("{}", json_pretty(&resources)?);
        return Ok(EXIT_SUCCESS);
    }
    if resources.is_empty() {
        println!("no resources match tags {tags:?}");
    }
    for r in &resources {
        let detail = match &r.payload {
            ResourcePayload::RepositorySource(s) => {
                format!("{} {} {}", s.location_url, s.distribution, s.components.join(" "))
            }
            ResourcePayload::DnsAddress(a) => format!("{} {}", a.ip, a.hostname),
        };
        println!(
            "{}  {detail}  (by {} at {})",
            r.id(),
            r.declared_by,
            r.declared_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(EXIT_SUCCESS)
}
