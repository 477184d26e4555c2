use crate::index::parse_signature;
use crate::signing::SigningService;
use crate::CoreError;
use fleetrepo_schema::KeyId;
use fleetrepo_store::{resolve_published, verify_snapshot_tree, IntegrityFailure, IntegrityReport};
use std::fs;
use std::path::Path;

/// Verify what clients of `dist` would download: the `Release.sig` against
/// `key_id`, then every index and package digest below the `Release`.
///
/// The published link is resolved once and every file is read from that
/// snapshot, so a publish racing with the check cannot mix two of them.
pub fn verify_distribution(
    docroot: &Path,
    dist: &str,
    signer: &dyn SigningService,
    key_id: &KeyId,
) -> Result<IntegrityReport, CoreError> {
    let snapshot = resolve_published(docroot, dist)?;
    let mut report = verify_snapshot_tree(&snapshot, dist)?;
    let release = fs::read(snapshot.join("Release"))?;
    let key = format!("{dist}/Release.sig");

    report.signatures_checked += 1;
    let sig_text = match fs::read_to_string(snapshot.join("Release.sig")) {
        Ok(t) => t,
        Err(e) => {
            report.failed.push(IntegrityFailure {
                key,
                reason: format!("signature read error: {e}"),
            });
            return Ok(report);
        }
    };
    let Some(sig) = parse_signature(&sig_text) else {
        report.failed.push(IntegrityFailure {
            key,
            reason: "malformed signature file".to_owned(),
        });
        return Ok(report);
    };
    if sig.key_id != *key_id {
        report.failed.push(IntegrityFailure {
            key,
            reason: format!("signed with '{}', expected '{key_id}'", sig.key_id),
        });
        return Ok(report);
    }
    match signer.verify(&release, &sig.signature, key_id) {
        Ok(()) => report.signatures_passed += 1,
        Err(e) => report.failed.push(IntegrityFailure {
            key,
            reason: e.to_string(),
        }),
    }
    Ok(report)
}
