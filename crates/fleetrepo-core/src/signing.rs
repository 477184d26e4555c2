//! Ed25519 signing service backed by a key directory.
//!
//! A keyring directory holds `{key_id}.key` records (private, mode 0600) and
//! `{key_id}.pub` files (public key only, base64). A keyring holding only
//! `.pub` files can verify but not sign.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use fleetrepo_schema::{validate_name, KeyId};
use fleetrepo_store::{write_atomic, write_atomic_mode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing key '{key_id}' is unavailable: {reason}")]
    KeyUnavailable { key_id: KeyId, reason: String },
    #[error("signing key '{key_id}' expired at {expired_at}")]
    KeyExpired {
        key_id: KeyId,
        expired_at: DateTime<Utc>,
    },
    #[error("signing key '{key_id}' is invalid: {reason}")]
    InvalidKey { key_id: KeyId, reason: String },
    #[error("signature does not verify against key '{0}'")]
    BadSignature(KeyId),
    #[error("key '{0}' already exists")]
    KeyExists(KeyId),
}

/// Signs repository metadata. Signatures are base64 text.
pub trait SigningService {
    fn sign(&self, payload: &[u8], key_id: &KeyId) -> Result<String, SigningError>;

    /// Public key material (base64) for `key_id`.
    fn public_key(&self, key_id: &KeyId) -> Result<String, SigningError>;

    fn verify(&self, payload: &[u8], signature: &str, key_id: &KeyId) -> Result<(), SigningError> {
        let public = self.public_key(key_id)?;
        verify_with_public_key(&public, payload, signature, key_id)
    }
}

/// On-disk form of a private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    pub secret: String,
    pub public: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{key_id}.key"))
    }

    fn pub_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{key_id}.pub"))
    }

    /// Create a new key pair. Refuses to overwrite an existing key.
    pub fn generate(&self, key_id: &KeyId, expires_in_days: Option<u32>) -> Result<KeyRecord, SigningError> {
        use rand::RngCore;

        let invalid = |reason: String| SigningError::InvalidKey {
            key_id: key_id.clone(),
            reason,
        };
        validate_name(key_id).map_err(|e| invalid(e.to_string()))?;
        if self.key_path(key_id).exists() {
            return Err(SigningError::KeyExists(key_id.clone()));
        }

        let mut secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut secret_bytes);
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let created_at = Utc::now();
        let record = KeyRecord {
            key_id: key_id.clone(),
            secret: B64.encode(signing_key.to_bytes()),
            public: B64.encode(signing_key.verifying_key().to_bytes()),
            created_at,
            expires_at: expires_in_days.map(|d| created_at + Duration::days(i64::from(d))),
        };

        let unavailable = |reason: String| SigningError::KeyUnavailable {
            key_id: key_id.clone(),
            reason,
        };
        let json = serde_json::to_string_pretty(&record).map_err(|e| invalid(e.to_string()))?;
        write_atomic(&self.key_path(key_id), json.as_bytes()).map_err(|e| unavailable(e.to_string()))?;
        write_atomic_mode(
            &self.pub_path(key_id),
            format!("{}\n", record.public).as_bytes(),
            0o644,
        )
        .map_err(|e| unavailable(e.to_string()))?;
        info!("generated signing key {key_id} in {}", self.dir.display());
        Ok(record)
    }

    /// Read the private record for `key_id`.
    pub fn record(&self, key_id: &KeyId) -> Result<KeyRecord, SigningError> {
        let path = self.key_path(key_id);
        let content = fs::read_to_string(&path).map_err(|e| SigningError::KeyUnavailable {
            key_id: key_id.clone(),
            reason: format!("{}: {e}", path.display()),
        })?;
        let record: KeyRecord = serde_json::from_str(&content).map_err(|e| SigningError::InvalidKey {
            key_id: key_id.clone(),
            reason: e.to_string(),
        })?;
        if record.key_id != *key_id {
            return Err(SigningError::InvalidKey {
                key_id: key_id.clone(),
                reason: format!("record names key '{}'", record.key_id),
            });
        }
        Ok(record)
    }

    fn signing_key(&self, key_id: &KeyId) -> Result<SigningKey, SigningError> {
        let record = self.record(key_id)?;
        if let Some(expired_at) = record.expires_at {
            if expired_at <= Utc::now() {
                return Err(SigningError::KeyExpired {
                    key_id: key_id.clone(),
                    expired_at,
                });
            }
        }
        let secret = decode_32(&record.secret, key_id)?;
        let key = SigningKey::from_bytes(&secret);
        if B64.encode(key.verifying_key().to_bytes()) != record.public.trim() {
            return Err(SigningError::InvalidKey {
                key_id: key_id.clone(),
                reason: "public half does not match secret".to_owned(),
            });
        }
        Ok(key)
    }

    /// Key ids present in the keyring, private or public-only.
    pub fn list(&self) -> Result<Vec<KeyId>, std::io::Error> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".key").or_else(|| name.strip_suffix(".pub")) {
                ids.push(KeyId::new(id));
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl SigningService for Keyring {
    fn sign(&self, payload: &[u8], key_id: &KeyId) -> Result<String, SigningError> {
        let key = self.signing_key(key_id)?;
        debug!("signing {} bytes with {key_id}", payload.len());
        Ok(B64.encode(key.sign(payload).to_bytes()))
    }

    fn public_key(&self, key_id: &KeyId) -> Result<String, SigningError> {
        let public = match self.record(key_id) {
            Ok(record) => record.public,
            Err(SigningError::KeyUnavailable { .. }) => {
                let path = self.pub_path(key_id);
                fs::read_to_string(&path).map_err(|e| SigningError::KeyUnavailable {
                    key_id: key_id.clone(),
                    reason: format!("{}: {e}", path.display()),
                })?
            }
            Err(e) => return Err(e),
        };
        let public = public.trim().to_owned();
        decode_32(&public, key_id)?;
        Ok(public)
    }
}

fn decode_32(b64: &str, key_id: &KeyId) -> Result<[u8; 32], SigningError> {
    let bytes = B64.decode(b64.trim()).map_err(|e| SigningError::InvalidKey {
        key_id: key_id.clone(),
        reason: format!("bad base64: {e}"),
    })?;
    bytes.as_slice().try_into().map_err(|_| SigningError::InvalidKey {
        key_id: key_id.clone(),
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

/// Verify a base64 signature with base64 public key material, as published
/// in `{docroot}/{repo}.gpg`.
pub fn verify_with_public_key(
    public: &str,
    payload: &[u8],
    signature: &str,
    key_id: &KeyId,
) -> Result<(), SigningError> {
    let key_bytes = decode_32(public, key_id)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| SigningError::InvalidKey {
        key_id: key_id.clone(),
        reason: e.to_string(),
    })?;
    let sig_bytes = B64
        .decode(signature.trim())
        .map_err(|_| SigningError::BadSignature(key_id.clone()))?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| SigningError::BadSignature(key_id.clone()))?;
    key.verify(payload, &sig)
        .map_err(|_| SigningError::BadSignature(key_id.clone()))
}
