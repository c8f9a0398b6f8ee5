//! Trust-On-First-Use host key management.
//!
//! Every outbound SSH handshake is gated by the [`verifier::HostKeyVerifier`],
//! which records first-contact keys, accepts matching keys, and rejects
//! changed keys until a human explicitly re-trusts them.

use chrono::{DateTime, Utc};
use russh::keys::{HashAlg, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{SshError, StoreError};

pub mod store;
pub mod verifier;

pub use store::{FileHostKeyStore, MemoryHostKeyStore};
pub use verifier::HostKeyVerifier;

/// Trust state of a stored host key. At most one record exists per
/// (host, port); `Changed` and `Revoked` records block connections until an
/// explicit administrative decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    Trusted,
    Changed,
    Revoked,
}

/// One remembered host key, identified by (host, port).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedHostKey {
    pub host: String,
    pub port: u16,
    pub algorithm: String,
    /// Base64 body of the public key, as it appears in OpenSSH format.
    pub key_base64: String,
    /// `SHA256:<base64>` fingerprint of the marshaled key.
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: TrustStatus,
    /// Candidate key captured on mismatch, held for the re-trust decision.
    /// Cleared when the record returns to `Trusted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingKey>,
}

/// The offered-but-rejected key recorded when a mismatch flips a record to
/// `Changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingKey {
    pub algorithm: String,
    pub key_base64: String,
    pub fingerprint: String,
    pub offered_at: DateTime<Utc>,
}

impl TrustedHostKey {
    /// Build a fresh trusted record from a live key.
    pub fn first_contact(host: &str, port: u16, key: &PublicKey) -> Result<Self, SshError> {
        let now = Utc::now();
        Ok(Self {
            host: host.to_string(),
            port,
            algorithm: key.algorithm().as_str().to_string(),
            key_base64: encode_key_base64(key)?,
            fingerprint: fingerprint_of(key),
            first_seen: now,
            last_seen: now,
            status: TrustStatus::Trusted,
            pending: None,
        })
    }
}

/// `SHA256:<base64>` fingerprint string for a public key.
pub fn fingerprint_of(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Base64 body of the key in OpenSSH one-line form.
pub fn encode_key_base64(key: &PublicKey) -> Result<String, SshError> {
    let openssh = key
        .to_openssh()
        .map_err(|e| SshError::HostKeyVerification(format!("cannot encode host key: {e}")))?;
    openssh
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| {
            SshError::HostKeyVerification("malformed OpenSSH key encoding".to_string())
        })
}

/// Persistence collaborator for trusted host keys. Implementations must be
/// safe for concurrent use; callers treat errors as "store unavailable".
pub trait HostKeyStore: Send + Sync {
    fn find(&self, host: &str, port: u16) -> Result<Option<TrustedHostKey>, StoreError>;
    fn upsert(&self, record: TrustedHostKey) -> Result<(), StoreError>;
    fn remove(&self, host: &str, port: u16) -> Result<bool, StoreError>;
    fn list(&self) -> Result<Vec<TrustedHostKey>, StoreError>;
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! Ed25519 public keys used across host-key tests.
    pub const KEY1: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";
    pub const KEY2: &str = "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";

    pub fn parse(b64: &str) -> russh::keys::PublicKey {
        russh::keys::parse_public_key_base64(b64).expect("parse test key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_keys::{KEY1, KEY2, parse};

    #[test]
    fn fingerprint_is_sha256_prefixed() {
        let key = parse(KEY1);
        assert!(fingerprint_of(&key).starts_with("SHA256:"));
    }

    #[test]
    fn different_keys_have_different_fingerprints() {
        assert_ne!(fingerprint_of(&parse(KEY1)), fingerprint_of(&parse(KEY2)));
    }

    #[test]
    fn encode_key_base64_roundtrips() {
        let key = parse(KEY1);
        let b64 = encode_key_base64(&key).expect("encode");
        assert_eq!(b64, KEY1);
    }

    #[test]
    fn first_contact_builds_trusted_record() {
        let key = parse(KEY1);
        let record = TrustedHostKey::first_contact("example.com", 22, &key).expect("record");

        assert_eq!(record.status, TrustStatus::Trusted);
        assert_eq!(record.algorithm, "ssh-ed25519");
        assert_eq!(record.key_base64, KEY1);
        assert_eq!(record.first_seen, record.last_seen);
        assert!(record.pending.is_none());
    }

    #[test]
    fn trust_status_serde_uses_snake_case() {
        let json = serde_json::to_string(&TrustStatus::Changed).unwrap();
        assert_eq!(json, "\"changed\"");
    }
}
