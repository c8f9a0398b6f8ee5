//! Typed gateway configuration loaded from TOML with environment overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration stored in bastion.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub hostkeys: HostKeyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Static server directory entries resolved by the config-backed
    /// `ServerDirectory`. A real deployment swaps this for a database-backed
    /// implementation behind the same trait.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for rolling log files; console-only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 0 disables russh-level keepalive.
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    /// Explicit opt-out of host key verification for interactive sessions.
    /// Loudly logged when enabled; never the implicit default.
    #[serde(default)]
    pub insecure_accept_any_host_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions older than this are closed by the background sweeper.
    #[serde(default = "default_session_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyConfig {
    /// JSON trust-store file; defaults to the platform state directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Pooled monitoring connections verify host keys through the same TOFU
    /// verifier as interactive sessions. Disabling this trades security for
    /// connect latency and is logged as a security event.
    #[serde(default = "default_true")]
    pub verify_host_keys: bool,
    #[serde(default = "default_monitor_interval")]
    pub default_interval_secs: u64,
    /// Consecutive collection failures before the monitor socket is closed
    /// as "target unreachable".
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

/// One static server directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: uuid::Uuid,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthKind,
    /// Environment variable holding the password (never stored inline).
    #[serde(default)]
    pub password_env: Option<String>,
    /// Path to a private key file.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Environment variable holding the key passphrase, if any.
    #[serde(default)]
    pub passphrase_env: Option<String>,
    /// Users allowed to reach this server; empty means any authenticated user.
    #[serde(default)]
    pub users: Vec<uuid::Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    Key,
}

fn default_listen() -> String {
    "127.0.0.1:8022".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    60
}

fn default_session_max_age() -> u64 {
    43200
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_monitor_interval() -> u64 {
    2
}

fn default_max_failures() -> u32 {
    3
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_dir: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive(),
            insecure_accept_any_host_key: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_session_max_age(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for HostKeyConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            verify_host_keys: true,
            default_interval_secs: default_monitor_interval(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            toml::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `BASTION_LISTEN` and `BASTION_LOG_DIR` override the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("BASTION_LISTEN") {
            self.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("BASTION_LOG_DIR") {
            self.server.log_dir = Some(PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        for entry in &self.servers {
            match entry.auth {
                AuthKind::Password if entry.password_env.is_none() => {
                    return Err(ConfigError::ServerEntry {
                        id: entry.id,
                        reason: "auth = \"password\" requires password_env".to_string(),
                    });
                }
                AuthKind::Key if entry.key_path.is_none() => {
                    return Err(ConfigError::ServerEntry {
                        id: entry.id,
                        reason: "auth = \"key\" requires key_path".to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen
            .parse()
            .map_err(|_| ConfigError::ListenAddr(self.server.listen.clone()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.connect_timeout_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.sessions.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }

    /// Trust-store file path, defaulting to the platform state directory.
    pub fn hostkeys_path(&self) -> PathBuf {
        if let Some(path) = &self.hostkeys.path {
            return path.clone();
        }
        directories::ProjectDirs::from("com", "bastion", "bastion")
            .map(|dirs| dirs.data_dir().join("hostkeys.json"))
            .unwrap_or_else(|| PathBuf::from("hostkeys.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = AppConfig::default();
        assert_eq!(config.ssh.connect_timeout_secs, 30);
        assert_eq!(config.ssh.keepalive_interval_secs, 60);
        assert!(!config.ssh.insecure_accept_any_host_key);
        assert!(config.monitor.verify_host_keys);
        assert_eq!(config.monitor.default_interval_secs, 2);
        assert_eq!(config.sessions.sweep_interval_secs, 300);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:9000"

            [ssh]
            connect_timeout_secs = 10
            keepalive_interval_secs = 0

            [monitor]
            verify_host_keys = false

            [[servers]]
            id = "6a37c9a0-1c4f-4b38-9f3e-2bfb9a1a8c11"
            host = "db01.internal"
            username = "deploy"
            auth = "password"
            password_env = "DB01_PASSWORD"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("parse");

        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.ssh.connect_timeout_secs, 10);
        assert_eq!(config.ssh.keepalive_interval_secs, 0);
        assert!(!config.monitor.verify_host_keys);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].port, 22);
        assert_eq!(config.servers[0].auth, AuthKind::Password);
    }

    #[test]
    fn listen_addr_rejects_garbage() {
        let mut config = AppConfig::default();
        config.server.listen = "not an address".to_string();
        assert!(config.listen_addr().is_err());
    }

    #[test]
    fn validate_rejects_password_entry_without_env() {
        let toml = r#"
            [[servers]]
            id = "6a37c9a0-1c4f-4b38-9f3e-2bfb9a1a8c11"
            host = "db01.internal"
            username = "deploy"
            auth = "password"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_key_entry_without_path() {
        let toml = r#"
            [[servers]]
            id = "6a37c9a0-1c4f-4b38-9f3e-2bfb9a1a8c11"
            host = "db01.internal"
            username = "deploy"
            auth = "key"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/bastion.toml")).expect("load");
        assert_eq!(config.server.listen, "127.0.0.1:8022");
    }
}
