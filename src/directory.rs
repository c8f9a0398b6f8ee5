//! Server directory collaborator: resolves (user, server) identities into
//! connection descriptors.
//!
//! Persistence of server records is out of scope for the gateway core; the
//! core only consumes this trait. The config-backed implementation below is
//! the stand-in a real deployment replaces with its own repository.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::SecretString;
use uuid::Uuid;

use crate::config::{AuthKind, ServerEntry};
use crate::error::DirectoryError;

/// Everything needed for one outbound connection attempt. Immutable per
/// attempt; secret material is decrypted/resolved just-in-time by the
/// directory and redacted from Debug output.
#[derive(Clone)]
pub struct TransportDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMaterial,
}

#[derive(Clone)]
pub enum AuthMaterial {
    Password(SecretString),
    PrivateKey {
        pem: SecretString,
        passphrase: Option<SecretString>,
    },
}

impl std::fmt::Debug for TransportDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .finish()
    }
}

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMaterial::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
            AuthMaterial::PrivateKey { .. } => {
                f.debug_tuple("PrivateKey").field(&"[REDACTED]").finish()
            }
        }
    }
}

/// Resolves a server's connection descriptor for a given user.
#[async_trait]
pub trait ServerDirectory: Send + Sync + 'static {
    async fn resolve(
        &self,
        user_id: Uuid,
        server_id: Uuid,
    ) -> Result<TransportDescriptor, DirectoryError>;
}

/// Directory backed by the `[[servers]]` config table. Secrets are read from
/// the environment or key files at resolve time, never held between calls.
pub struct StaticDirectory {
    entries: HashMap<Uuid, ServerEntry>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<ServerEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    fn load_auth(entry: &ServerEntry) -> Result<AuthMaterial, DirectoryError> {
        match entry.auth {
            AuthKind::Password => {
                let var = entry.password_env.as_deref().ok_or_else(|| {
                    DirectoryError::Credential {
                        server_id: entry.id,
                        reason: "no password_env configured".to_string(),
                    }
                })?;
                let password =
                    std::env::var(var).map_err(|_| DirectoryError::Credential {
                        server_id: entry.id,
                        reason: format!("environment variable {var} is not set"),
                    })?;
                Ok(AuthMaterial::Password(SecretString::from(password)))
            }
            AuthKind::Key => {
                let path: &PathBuf =
                    entry.key_path.as_ref().ok_or_else(|| DirectoryError::Credential {
                        server_id: entry.id,
                        reason: "no key_path configured".to_string(),
                    })?;
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    DirectoryError::Credential {
                        server_id: entry.id,
                        reason: format!("cannot read key file {}: {e}", path.display()),
                    }
                })?;
                let passphrase = match &entry.passphrase_env {
                    Some(var) => std::env::var(var).ok().map(SecretString::from),
                    None => None,
                };
                Ok(AuthMaterial::PrivateKey {
                    pem: SecretString::from(pem),
                    passphrase,
                })
            }
        }
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn resolve(
        &self,
        user_id: Uuid,
        server_id: Uuid,
    ) -> Result<TransportDescriptor, DirectoryError> {
        let entry = self
            .entries
            .get(&server_id)
            .ok_or(DirectoryError::NotFound { user_id, server_id })?;

        if !entry.users.is_empty() && !entry.users.contains(&user_id) {
            return Err(DirectoryError::NotFound { user_id, server_id });
        }

        Ok(TransportDescriptor {
            host: entry.host.clone(),
            port: entry.port,
            username: entry.username.clone(),
            auth: Self::load_auth(entry)?,
        })
    }
}

/// In-memory directory used by tests.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: parking_lot::RwLock<HashMap<(Uuid, Uuid), TransportDescriptor>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: Uuid, server_id: Uuid, descriptor: TransportDescriptor) {
        self.entries
            .write()
            .insert((user_id, server_id), descriptor);
    }
}

#[async_trait]
impl ServerDirectory for MemoryDirectory {
    async fn resolve(
        &self,
        user_id: Uuid,
        server_id: Uuid,
    ) -> Result<TransportDescriptor, DirectoryError> {
        self.entries
            .read()
            .get(&(user_id, server_id))
            .cloned()
            .ok_or(DirectoryError::NotFound { user_id, server_id })
    }
}
