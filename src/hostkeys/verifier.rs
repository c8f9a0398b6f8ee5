//! The TOFU verification state machine.
//!
//! Per (host, port):
//!
//! - Unknown → Trusted: store the key, accept, warn-log the new fingerprint.
//! - Trusted → Trusted: fingerprint matches; bump last-seen, accept.
//! - Trusted → Changed: fingerprint differs; flip the stored record to
//!   `changed` (durably, before returning), reject with both fingerprints.
//! - Changed/Revoked → Trusted: only via the explicit [`HostKeyVerifier::trust`]
//!   operation, which re-validates the fingerprint against the candidate key
//!   captured at mismatch time.
//!
//! If the store itself errors, the verifier fails open (accepts) with a
//! distinct audit event, trading MITM detection for availability.

use std::sync::Arc;

use chrono::Utc;
use russh::keys::PublicKey;

use crate::error::{SshError, StoreError};
use crate::security_log;

use super::{
    HostKeyStore, PendingKey, TrustStatus, TrustedHostKey, encode_key_base64, fingerprint_of,
};

pub struct HostKeyVerifier {
    store: Arc<dyn HostKeyStore>,
}

impl HostKeyVerifier {
    pub fn new(store: Arc<dyn HostKeyStore>) -> Self {
        Self { store }
    }

    /// Gate a handshake. `Ok(())` accepts the connection.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let fingerprint = fingerprint_of(key);

        let existing = match self.store.find(host, port) {
            Ok(record) => record,
            Err(e) => {
                security_log::log_hostkey_fail_open(host, port, &fingerprint, &e.to_string());
                return Ok(());
            }
        };

        match existing {
            None => self.trust_first_contact(host, port, key, &fingerprint),
            Some(record) => match record.status {
                TrustStatus::Revoked => Err(SshError::HostKeyVerification(format!(
                    "host key for {host}:{port} has been revoked"
                ))),
                TrustStatus::Trusted if record.fingerprint == fingerprint => {
                    self.bump_last_seen(record);
                    tracing::debug!("Host key verified for {}:{}", host, port);
                    Ok(())
                }
                TrustStatus::Trusted => self.flag_changed(record, key, &fingerprint),
                TrustStatus::Changed => {
                    // Still awaiting a human decision; reject regardless of
                    // which key is offered now.
                    Err(SshError::HostKeyMismatch {
                        host: host.to_string(),
                        port,
                        old_fingerprint: record.fingerprint.clone(),
                        new_fingerprint: fingerprint,
                        key_type: key.algorithm().as_str().to_string(),
                    })
                }
            },
        }
    }

    fn trust_first_contact(
        &self,
        host: &str,
        port: u16,
        key: &PublicKey,
        fingerprint: &str,
    ) -> Result<(), SshError> {
        let record = TrustedHostKey::first_contact(host, port, key)?;
        let key_type = record.algorithm.clone();
        if let Err(e) = self.store.upsert(record) {
            // Accepting without a durable record is the same availability
            // tradeoff as a failed find; surface it the same way.
            security_log::log_hostkey_fail_open(host, port, fingerprint, &e.to_string());
            return Ok(());
        }
        security_log::log_hostkey_first_trust(host, port, fingerprint, &key_type);
        Ok(())
    }

    fn bump_last_seen(&self, mut record: TrustedHostKey) {
        record.last_seen = Utc::now();
        if let Err(e) = self.store.upsert(record) {
            tracing::debug!("Could not bump host key last-seen: {}", e);
        }
    }

    /// A trusted record saw a different key: durably flip it to `changed`
    /// (recording the offered key for the re-trust decision), then reject.
    fn flag_changed(
        &self,
        mut record: TrustedHostKey,
        key: &PublicKey,
        new_fingerprint: &str,
    ) -> Result<(), SshError> {
        let key_type = key.algorithm().as_str().to_string();
        security_log::log_hostkey_mismatch(
            &record.host,
            record.port,
            &record.fingerprint,
            new_fingerprint,
            &key_type,
        );

        let err = SshError::HostKeyMismatch {
            host: record.host.clone(),
            port: record.port,
            old_fingerprint: record.fingerprint.clone(),
            new_fingerprint: new_fingerprint.to_string(),
            key_type: key_type.clone(),
        };

        record.status = TrustStatus::Changed;
        record.pending = Some(PendingKey {
            algorithm: key_type,
            key_base64: encode_key_base64(key)?,
            fingerprint: new_fingerprint.to_string(),
            offered_at: Utc::now(),
        });
        if let Err(e) = self.store.upsert(record) {
            // The rejection stands either way; the durable flip is best-effort
            // under a broken store.
            tracing::warn!("Could not persist changed host key status: {}", e);
        }

        Err(err)
    }

    /// Administrative re-trust: promote the pending candidate captured at
    /// mismatch time, after validating the operator-supplied fingerprint
    /// against it. Also flips `Revoked` records back when the fingerprint
    /// matches the stored key.
    pub fn trust(
        &self,
        host: &str,
        port: u16,
        expected_fingerprint: &str,
    ) -> Result<TrustedHostKey, SshError> {
        let mut record = self
            .store
            .find(host, port)
            .map_err(store_unavailable)?
            .ok_or_else(|| {
                SshError::HostKeyVerification(format!("no host key record for {host}:{port}"))
            })?;

        match record.status {
            TrustStatus::Trusted => {
                // Nothing pending; treat a matching fingerprint as a no-op.
                if record.fingerprint == expected_fingerprint {
                    return Ok(record);
                }
                Err(SshError::HostKeyVerification(format!(
                    "fingerprint does not match trusted key for {host}:{port}"
                )))
            }
            TrustStatus::Changed => {
                let pending = record.pending.take().ok_or_else(|| {
                    SshError::HostKeyVerification(format!(
                        "no pending key recorded for {host}:{port}; reconnect first"
                    ))
                })?;
                if pending.fingerprint != expected_fingerprint {
                    record.pending = Some(pending);
                    return Err(SshError::HostKeyVerification(format!(
                        "fingerprint does not match the offered key for {host}:{port}"
                    )));
                }
                record.algorithm = pending.algorithm;
                record.key_base64 = pending.key_base64;
                record.fingerprint = pending.fingerprint;
                record.status = TrustStatus::Trusted;
                record.last_seen = Utc::now();
                self.store
                    .upsert(record.clone())
                    .map_err(store_unavailable)?;
                security_log::log_hostkey_retrust(host, port, &record.fingerprint);
                Ok(record)
            }
            TrustStatus::Revoked => {
                if record.fingerprint != expected_fingerprint {
                    return Err(SshError::HostKeyVerification(format!(
                        "fingerprint does not match revoked key for {host}:{port}"
                    )));
                }
                record.status = TrustStatus::Trusted;
                record.last_seen = Utc::now();
                self.store
                    .upsert(record.clone())
                    .map_err(store_unavailable)?;
                security_log::log_hostkey_retrust(host, port, &record.fingerprint);
                Ok(record)
            }
        }
    }

    /// Administrative revoke: the key stays on file but blocks connections.
    pub fn revoke(&self, host: &str, port: u16) -> Result<(), SshError> {
        let mut record = self
            .store
            .find(host, port)
            .map_err(store_unavailable)?
            .ok_or_else(|| {
                SshError::HostKeyVerification(format!("no host key record for {host}:{port}"))
            })?;
        record.status = TrustStatus::Revoked;
        self.store.upsert(record).map_err(store_unavailable)?;
        security_log::log_hostkey_revoke(host, port);
        Ok(())
    }

    /// Administrative delete: forget the record entirely; the next handshake
    /// is first contact again.
    pub fn delete(&self, host: &str, port: u16) -> Result<bool, SshError> {
        self.store.remove(host, port).map_err(store_unavailable)
    }

    pub fn list(&self) -> Result<Vec<TrustedHostKey>, SshError> {
        self.store.list().map_err(store_unavailable)
    }
}

fn store_unavailable(e: StoreError) -> SshError {
    SshError::HostKeyVerification(format!("trust store unavailable: {e}"))
}
