//! `Packages`, `Release` and `Release.sig` rendering.
//!
//! Output depends only on its inputs: the same index, distribution and date
//! always render to the same bytes.

use chrono::{DateTime, Utc};
use fleetrepo_schema::{Distribution, KeyId, PackageFile};
use fleetrepo_store::ReleaseEntry;
use std::fmt::Write;

/// Render one `Packages` file. `packages` must already be in index order.
pub fn render_packages(packages: &[PackageFile]) -> String {
    let mut out = String::new();
    for p in packages {
        let _ = write!(
            out,
            "Package: {}\nVersion: {}\nArchitecture: {}\nFilename: {}\nSize: {}\nSHA256: {}\n\n",
            p.name, p.version, p.architecture, p.path, p.size, p.checksum
        );
    }
    out
}

/// Append a control-file field. Continuation lines start with a space and an
/// empty line becomes ` .`, so no value can start a field of its own.
fn write_field(out: &mut String, name: &str, value: &str) {
    let mut lines = value.trim_end().lines();
    let _ = writeln!(out, "{name}: {}", lines.next().unwrap_or_default().trim_end());
    for line in lines {
        let line = line.trim_end();
        if line.trim().is_empty() {
            out.push_str(" .\n");
        } else {
            let _ = writeln!(out, " {}", line.trim_start());
        }
    }
}

/// Render the `Release` descriptor. `entries` are sorted by path here.
pub fn render_release(dist: &Distribution, date: DateTime<Utc>, entries: &[ReleaseEntry]) -> String {
    let mut out = String::new();
    write_field(&mut out, "Origin", &dist.origin);
    write_field(&mut out, "Label", &dist.label);
    write_field(&mut out, "Suite", &dist.suite);
    let _ = writeln!(out, "Codename: {}", dist.name);
    let _ = writeln!(out, "Date: {}", date.to_rfc2822());
    let archs: Vec<&str> = dist.architectures.iter().map(String::as_str).collect();
    let _ = writeln!(out, "Architectures: {}", archs.join(" "));
    let _ = writeln!(out, "Components: {}", dist.components.join(" "));
    if !dist.description.trim().is_empty() {
        write_field(&mut out, "Description", &dist.description);
    }
    if dist.not_automatic {
        out.push_str("NotAutomatic: yes\n");
        if dist.auto_promote {
            out.push_str("ButAutomaticUpgrades: yes\n");
        }
    }

    let mut sorted: Vec<&ReleaseEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    out.push_str("SHA256:\n");
    for e in sorted {
        let _ = writeln!(out, " {} {} {}", e.checksum, e.size, e.path);
    }
    out
}

/// Parsed `Release.sig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSignature {
    pub key_id: KeyId,
    pub signature: String,
}

pub fn render_signature(key_id: &KeyId, signature: &str) -> String {
    format!("Key-Id: {key_id}\n{signature}\n")
}

pub fn parse_signature(text: &str) -> Option<ReleaseSignature> {
    let mut lines = text.lines();
    let key_id = lines.next()?.strip_prefix("Key-Id:")?.trim();
    let signature = lines.next()?.trim();
    if key_id.is_empty() || signature.is_empty() {
        return None;
    }
    Some(ReleaseSignature {
        key_id: KeyId::new(key_id),
        signature: signature.to_owned(),
    })
}
