use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    ListenAddr(String),

    #[error("Server entry '{id}' is invalid: {reason}")]
    ServerEntry { id: uuid::Uuid, reason: String },
}

/// SSH-related errors
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key material error: {0}")]
    KeyMaterial(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Timeout connecting to {0}")]
    Timeout(String),

    #[error(
        "Host key for {host}:{port} has changed: stored {old_fingerprint}, offered {new_fingerprint} ({key_type})"
    )]
    HostKeyMismatch {
        host: String,
        port: u16,
        old_fingerprint: String,
        new_fingerprint: String,
        key_type: String,
    },

    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("russh error: {0}")]
    Russh(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Russh(err.to_string())
    }
}

impl SshError {
    /// Machine-readable code sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            SshError::ConnectionFailed { .. } => "unreachable",
            SshError::AuthenticationFailed(_) => "auth_failed",
            SshError::KeyMaterial(_) => "auth_failed",
            SshError::Channel(_) => "channel_error",
            SshError::Timeout(_) => "timeout",
            SshError::HostKeyMismatch { .. } => "host_key_changed",
            SshError::HostKeyVerification(_) => "host_key_rejected",
            SshError::Russh(_) => "protocol_error",
        }
    }

    /// Connectivity errors are retryable by the caller; auth and host-key
    /// failures are terminal until a human intervenes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::ConnectionFailed { .. } | SshError::Timeout(_)
        )
    }
}

/// Trust-store persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Trust store I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Trust store is corrupt: {0}")]
    Corrupt(String),

    #[error("Trust store unavailable: {0}")]
    Unavailable(String),
}

/// Server directory (collaborator) errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Server {server_id} not found for user {user_id}")]
    NotFound {
        user_id: uuid::Uuid,
        server_id: uuid::Uuid,
    },

    #[error("Credential material unavailable for server {server_id}: {reason}")]
    Credential {
        server_id: uuid::Uuid,
        reason: String,
    },
}
