//! Debian package version ordering.
//!
//! A version is `[epoch:]upstream[-revision]`. Comparison follows dpkg:
//! epochs numerically, then upstream and revision with the alternating
//! non-digit / digit algorithm where `~` sorts before everything, even the
//! end of the string.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebVersion<'a> {
    pub epoch: u64,
    pub upstream: &'a str,
    pub revision: &'a str,
}

impl<'a> DebVersion<'a> {
    /// Split a version string, or `None` when the epoch is present but not a
    /// number dpkg accepts (digits only, at most `u32::MAX`).
    pub fn try_parse(version: &'a str) -> Option<Self> {
        let (epoch, rest) = match version.split_once(':') {
            Some((e, rest)) => {
                if e.is_empty() || !e.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                (u64::from(e.parse::<u32>().ok()?), rest)
            }
            None => (0, version),
        };
        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((u, r)) => (u, r),
            None => (rest, ""),
        };
        Some(Self {
            epoch,
            upstream,
            revision,
        })
    }

    /// Like [`try_parse`](Self::try_parse), but an unusable epoch is kept as
    /// part of the upstream version so that ordering stays total.
    pub fn parse(version: &'a str) -> Self {
        Self::try_parse(version).unwrap_or(Self {
            epoch: 0,
            upstream: version,
            revision: "",
        })
    }
}

/// Whether `version` has an epoch dpkg would accept.
pub fn is_valid_version(version: &str) -> bool {
    DebVersion::try_parse(version).is_some()
}

impl Ord for DebVersion<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_part(self.upstream, other.upstream))
            .then_with(|| compare_part(self.revision, other.revision))
    }
}

impl PartialOrd for DebVersion<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two version strings with dpkg semantics.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    DebVersion::parse(a).cmp(&DebVersion::parse(b))
}

fn char_weight(c: Option<u8>) -> i32 {
    match c {
        Some(b'~') => -1,
        None => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(c) => i32::from(c) + 256,
    }
}

fn compare_part(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        // Non-digit prefix, character by character.
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ca = a.get(i).copied().filter(|c| !c.is_ascii_digit());
            let cb = b.get(j).copied().filter(|c| !c.is_ascii_digit());
            let ord = char_weight(ca).cmp(&char_weight(cb));
            if ord != Ordering::Equal {
                return ord;
            }
            if ca.is_some() {
                i += 1;
            }
            if cb.is_some() {
                j += 1;
            }
        }

        // Numeric run, compared by value without overflow.
        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }
        let start_a = i;
        let start_b = j;
        while i < a.len() && a[i].is_ascii_digit() {
            i += 1;
        }
        while j < b.len() && b[j].is_ascii_digit() {
            j += 1;
        }
        let da = &a[start_a..i];
        let db = &b[start_b..j];
        let ord = da.len().cmp(&db.len()).then_with(|| da.cmp(db));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
