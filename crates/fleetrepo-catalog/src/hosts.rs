//! Managed block in a hosts file.
//!
//! Only the lines between the two markers belong to fleetrepo; everything
//! else in the file is preserved byte for byte.

use crate::state::HostsEntry;
use crate::CatalogError;
use fleetrepo_store::write_atomic_mode;
use std::fs;
use std::path::Path;

pub const BEGIN_MARKER: &str = "# BEGIN fleetrepo managed";
pub const END_MARKER: &str = "# END fleetrepo managed";

/// Split `content` into the unmanaged text and the managed lines.
pub fn split_managed(content: &str) -> (String, Vec<String>) {
    let mut outside = String::new();
    let mut inside = Vec::new();
    let mut in_block = false;
    for line in content.lines() {
        match line.trim_end() {
            BEGIN_MARKER => in_block = true,
            END_MARKER if in_block => in_block = false,
            _ if in_block => inside.push(line.to_owned()),
            _ => {
                outside.push_str(line);
                outside.push('\n');
            }
        }
    }
    (outside, inside)
}

/// Render the full file: unmanaged text followed by one sorted managed
/// block. No block is written when there are no entries.
pub fn render(outside: &str, entries: &[HostsEntry]) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|e| format!("{} {}", e.ip, e.hostname))
        .collect();
    lines.sort();
    lines.dedup();

    let mut out = outside.to_owned();
    if lines.is_empty() {
        return out;
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(BEGIN_MARKER);
    out.push('\n');
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(END_MARKER);
    out.push('\n');
    out
}

/// Make the managed block of `path` hold exactly `entries`. Returns whether
/// the file changed. A missing file with nothing to manage stays missing.
pub fn apply_hosts(path: &Path, entries: &[HostsEntry]) -> Result<bool, CatalogError> {
    let current = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if entries.is_empty() {
                return Ok(false);
            }
            String::new()
        }
        Err(e) => return Err(e.into()),
    };
    if entries.is_empty() && !current.lines().any(|l| l.trim_end() == BEGIN_MARKER) {
        return Ok(false);
    }
    let (outside, _) = split_managed(&current);
    let desired = render(&outside, entries);
    if desired == current {
        return Ok(false);
    }
    write_atomic_mode(path, desired.as_bytes(), 0o644)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(ip: &str, host: &str) -> HostsEntry {
        HostsEntry {
            ip: ip.to_owned(),
            hostname: host.to_owned(),
        }
    }

    const BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

    #[test]
    fn block_is_appended_and_sorted() {
        let out = render(BASE, &[e("10.0.0.6", "b.example.com"), e("10.0.0.5", "a.example.com")]);
        assert_eq!(
            out,
            "127.0.0.1 localhost\n::1 localhost\n# BEGIN fleetrepo managed\n10.0.0.5 a.example.com\n10.0.0.6 b.example.com\n# END fleetrepo managed\n"
        );
    }

    #[test]
    fn split_recovers_outside_text() {
        let full = render(BASE, &[e("10.0.0.5", "apt.example.com")]);
        let (outside, inside) = split_managed(&full);
        assert_eq!(outside, BASE);
        assert_eq!(inside, vec!["10.0.0.5 apt.example.com"]);
    }

    #[test]
    fn apply_is_idempotent_and_preserves_other_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, BASE).unwrap();

        let entries = [e("10.0.0.5", "apt.example.com")];
        assert!(apply_hosts(&path, &entries).unwrap());
        assert!(!apply_hosts(&path, &entries).unwrap());

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(BASE));
        assert!(content.contains("10.0.0.5 apt.example.com"));

        assert!(apply_hosts(&path, &[]).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), BASE);
    }

    #[test]
    fn unmanaged_file_is_left_alone_when_nothing_is_managed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, "127.0.0.1 localhost").unwrap();
        assert!(!apply_hosts(&path, &[]).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "127.0.0.1 localhost");
    }

    #[test]
    fn missing_file_without_entries_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        assert!(!apply_hosts(&path, &[]).unwrap());
        assert!(!path.exists());
    }
}
