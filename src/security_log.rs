//! Security event logging for audit trails.
//!
//! Provides structured logging functions for security-relevant events such as
//! authentication attempts, connection establishment, and host key trust
//! decisions.
//!
//! All security events are logged with `target: "security"` to allow filtering
//! in production environments:
//!
//! ```bash
//! RUST_LOG=security=info bastion
//! ```

use tracing::{info, warn};

/// Log an SSH authentication attempt.
///
/// Called before attempting to authenticate with a remote host.
pub fn log_auth_attempt(host: &str, port: u16, username: &str, method: &str) {
    info!(
        target: "security",
        event = "auth_attempt",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        "SSH authentication attempt"
    );
}

/// Log a successful SSH authentication.
pub fn log_auth_success(host: &str, port: u16, username: &str, method: &str) {
    info!(
        target: "security",
        event = "auth_success",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        "SSH authentication succeeded"
    );
}

/// Log a failed SSH authentication attempt.
pub fn log_auth_failure(host: &str, port: u16, username: &str, method: &str, reason: &str) {
    warn!(
        target: "security",
        event = "auth_failure",
        host = %host,
        port = port,
        username = %username,
        method = %method,
        reason = %reason,
        "SSH authentication failed"
    );
}

/// Log the first-contact trust of an unknown host key (TOFU).
pub fn log_hostkey_first_trust(host: &str, port: u16, fingerprint: &str, key_type: &str) {
    warn!(
        target: "security",
        event = "hostkey_first_trust",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        key_type = %key_type,
        "Trusting previously unseen host key on first use"
    );
}

/// Log a host key mismatch (potential MITM). Always followed by a rejected
/// connection.
pub fn log_hostkey_mismatch(
    host: &str,
    port: u16,
    old_fingerprint: &str,
    new_fingerprint: &str,
    key_type: &str,
) {
    warn!(
        target: "security",
        event = "hostkey_mismatch",
        host = %host,
        port = port,
        old_fingerprint = %old_fingerprint,
        new_fingerprint = %new_fingerprint,
        key_type = %key_type,
        "HOST KEY CHANGED - rejecting connection"
    );
}

/// Log that verification was skipped because the trust store is unavailable.
///
/// This is the fail-open availability tradeoff; it must be distinguishable
/// from a normal trusted match in audit logs.
pub fn log_hostkey_fail_open(host: &str, port: u16, fingerprint: &str, reason: &str) {
    warn!(
        target: "security",
        event = "hostkey_fail_open",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        reason = %reason,
        "Trust store unavailable; accepting host key WITHOUT verification"
    );
}

/// Log an administrative re-trust of a changed or revoked host key.
pub fn log_hostkey_retrust(host: &str, port: u16, fingerprint: &str) {
    warn!(
        target: "security",
        event = "hostkey_retrust",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        "Host key explicitly re-trusted by administrator"
    );
}

/// Log an administrative host key revocation.
pub fn log_hostkey_revoke(host: &str, port: u16) {
    warn!(
        target: "security",
        event = "hostkey_revoke",
        host = %host,
        port = port,
        "Host key revoked by administrator"
    );
}

/// Log that host key verification is disabled for a connection (explicit
/// insecure opt-in).
pub fn log_insecure_hostkey_policy(host: &str, port: u16, fingerprint: &str) {
    warn!(
        target: "security",
        event = "hostkey_insecure_policy",
        host = %host,
        port = port,
        fingerprint = %fingerprint,
        "Host key verification DISABLED by configuration for this connection"
    );
}

/// Log an SSH disconnect.
pub fn log_ssh_disconnect(host: &str, port: u16, username: &str) {
    info!(
        target: "security",
        event = "ssh_disconnect",
        host = %host,
        port = port,
        username = %username,
        "SSH connection closed"
    );
}
