use super::{catalog, colorize_status, json_pretty, node_section, EXIT_SUCCESS};
use fleetrepo_catalog::DeclareOutcome;
use fleetrepo_schema::{
    parse_tags, DnsAddress, KeyId, RepoConfig, RepositorySource, Resource, ResourceKind,
    ResourcePayload,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A resource as written by an operator: no author, no timestamp. Both are
/// stamped at declaration time.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceSpec {
    name: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    payload: ResourcePayload,
}

/// Flags describing a resource on the command line.
#[derive(Debug, Default)]
pub struct DeclareArgs {
    pub file: Option<PathBuf>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub tags: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub url: Option<String>,
    pub distribution: Option<String>,
    pub components: Option<String>,
    pub key_id: Option<String>,
    pub key_url: Option<String>,
    pub include_source: bool,
}

fn required<'a>(value: Option<&'a String>, flag: &str) -> Result<&'a str, String> {
    value
        .map(String::as_str)
        .ok_or_else(|| format!("--{flag} is required"))
}

/// Comma-separated components in the order given.
fn split_components(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

fn spec_from_args(args: &DeclareArgs) -> Result<ResourceSpec, String> {
    if let Some(path) = &args.file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        return serde_json::from_str(&content)
            .map_err(|e| format!("invalid resource file {}: {e}", path.display()));
    }

    let kind: ResourceKind = required(args.kind.as_ref(), "kind")?
        .parse()
        .map_err(|e: fleetrepo_schema::ResourceError| e.to_string())?;
    let name = required(args.name.as_ref(), "name")?.to_owned();
    let payload = match kind {
        ResourceKind::DnsAddress => ResourcePayload::DnsAddress(DnsAddress {
            hostname: args.hostname.clone().unwrap_or_else(|| name.clone()),
            ip: required(args.ip.as_ref(), "ip")?.to_owned(),
        }),
        ResourceKind::RepositorySource => {
            let url = required(args.url.as_ref(), "url")?.to_owned();
            let key_source_url = match &args.key_url {
                Some(k) => k.clone(),
                None => format!("{}/{name}.gpg", url.trim_end_matches('/')),
            };
            ResourcePayload::RepositorySource(RepositorySource {
                location_url: url,
                distribution: required(args.distribution.as_ref(), "distribution")?.to_owned(),
                components: split_components(args.components.as_deref().unwrap_or("main")),
                key_id: KeyId::new(required(args.key_id.as_ref(), "key-id")?),
                key_source_url,
                include_source: args.include_source,
            })
        }
    };
    Ok(ResourceSpec {
        name,
        tags: parse_tags(args.tags.as_deref().unwrap_or_default()),
        payload,
    })
}

pub fn run(
    config: &RepoConfig,
    location: Option<&str>,
    args: &DeclareArgs,
    json: bool,
) -> Result<u8, String> {
    let node = node_section(config)?;
    let spec = spec_from_args(args)?;
    let tags = if spec.tags.is_empty() {
        node.tags.clone()
    } else {
        spec.tags
    };
    let resource = Resource::new(spec.name, tags, node.id.clone(), spec.payload);
    resource.validate().map_err(|e| e.to_string())?;

    let backend = catalog(config, location)?;
    let outcome = backend.declare(&resource).map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({ "id": resource.id(), "outcome": outcome });
        println!("{}", json_pretty(&payload)?);
    } else {
        let word = match outcome {
            DeclareOutcome::Declared => "declared",
            DeclareOutcome::Stale => "stale",
        };
        println!("{} {}", resource.id(), colorize_status(word));
    }
    Ok(EXIT_SUCCESS)
}
