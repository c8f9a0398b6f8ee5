use std::sync::Arc;
use std::time::Duration;

use russh::ChannelMsg;
use russh::client::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::SshError;
use crate::security_log;

use super::handler::ClientHandler;
use super::shell::{ShellChannel, ShellEvent};

/// Result of a non-interactive exec, with stdout and stderr separated.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// An authenticated SSH connection.
///
/// Shell channels and exec channels are multiplexed over the one
/// underlying connection via [`Transport::open_shell`] and
/// [`Transport::exec`].
pub struct Transport {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    host: String,
    port: u16,
    username: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish()
    }
}

impl Transport {
    pub(super) fn new(handle: Handle<ClientHandler>, host: String, port: u16, username: String) -> Self {
        Self {
            handle: Arc::new(Mutex::new(handle)),
            host,
            port,
            username,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open an interactive shell channel with a PTY of the given size.
    pub async fn open_shell(
        &self,
        cols: u16,
        rows: u16,
        event_tx: mpsc::Sender<ShellEvent>,
        cancel: CancellationToken,
    ) -> Result<ShellChannel, SshError> {
        let handle = self.handle.lock().await;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(format!("Failed to open channel: {e}")))?;
        drop(handle);

        channel
            .request_pty(false, "xterm-256color", cols as u32, rows as u32, 0, 0, &[])
            .await
            .map_err(|e| SshError::Channel(format!("PTY request failed: {e}")))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::Channel(format!("Shell request failed: {e}")))?;

        Ok(ShellChannel::spawn(channel, event_tx, cancel))
    }

    /// Run a command on a fresh exec channel and collect its output.
    pub async fn exec(&self, command: &str, timeout_secs: u64) -> Result<CommandOutput, SshError> {
        let run = async {
            let handle = self.handle.lock().await;
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| SshError::Channel(format!("Failed to open channel: {e}")))?;
            drop(handle);

            channel
                .exec(true, command)
                .await
                .map_err(|e| SshError::Channel(format!("Failed to exec '{command}': {e}")))?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            let mut exit_code: i32 = 0;

            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        if let Ok(s) = std::str::from_utf8(&data) {
                            stdout.push_str(s);
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if let Ok(s) = std::str::from_utf8(&data) {
                            stderr.push_str(s);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = exit_status as i32;
                    }
                    // Exit status can still arrive after EOF.
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }

            Ok(CommandOutput {
                stdout,
                stderr,
                exit_code,
            })
        };

        match timeout(Duration::from_secs(timeout_secs), run).await {
            Ok(result) => result,
            Err(_) => Err(SshError::Channel(format!(
                "Command '{command}' timed out after {timeout_secs} seconds"
            ))),
        }
    }

    /// Whether the underlying connection is still up.
    pub async fn is_connected(&self) -> bool {
        !self.handle.lock().await.is_closed()
    }

    /// Send an SSH disconnect and drop the connection.
    pub async fn disconnect(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("SSH disconnect for {}:{} failed: {}", self.host, self.port, e);
        }
        security_log::log_ssh_disconnect(&self.host, self.port, &self.username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_separates_streams() {
        let out = CommandOutput {
            stdout: "cpu 10 20\n".to_string(),
            stderr: "df: /mnt: permission denied\n".to_string(),
            exit_code: 1,
        };
        assert!(out.stdout.contains("cpu"));
        assert!(out.stderr.contains("denied"));
        assert_eq!(out.exit_code, 1);
    }

    #[test]
    fn command_output_clone_is_independent() {
        let original = CommandOutput {
            stdout: "a".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        let mut cloned = original.clone();
        cloned.stdout.push('b');
        assert_eq!(original.stdout, "a");
    }
}
