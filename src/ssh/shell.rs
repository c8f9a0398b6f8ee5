use russh::{Channel, ChannelMsg, client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SshError;

/// Commands accepted by the channel task.
#[derive(Debug)]
pub enum ShellCommand {
    /// Raw bytes for the remote PTY (keystrokes, pastes).
    Data(Vec<u8>),
    WindowChange { cols: u16, rows: u16 },
}

/// Events emitted by the channel task.
#[derive(Debug)]
pub enum ShellEvent {
    /// Output bytes from the remote shell. Stderr shares this stream; the
    /// PTY already interleaves both on the server side.
    Output(Vec<u8>),
    /// The channel ended, remotely or via cancellation.
    Closed { exit_code: Option<u32> },
}

/// Handle to a running interactive shell channel.
///
/// A spawned task owns the russh channel and serializes all reads and
/// writes on it; this handle only feeds the task's command queue.
pub struct ShellChannel {
    command_tx: mpsc::Sender<ShellCommand>,
}

impl std::fmt::Debug for ShellChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellChannel")
            .field("command_tx", &"<channel>")
            .finish()
    }
}

impl ShellChannel {
    /// Spawn the task that owns `channel`. Output and the final close event
    /// arrive on `event_tx`; cancelling `cancel` tears the channel down.
    pub fn spawn(
        channel: Channel<client::Msg>,
        event_tx: mpsc::Sender<ShellEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel::<ShellCommand>(256);
        tokio::spawn(run_channel(channel, command_rx, event_tx, cancel));
        Self { command_tx }
    }

    /// Queue raw input bytes for the remote shell.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), SshError> {
        self.command_tx
            .send(ShellCommand::Data(data))
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    /// Build a detached handle whose command queue is handed back to the
    /// caller instead of a channel task.
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::Receiver<ShellCommand>) {
        let (command_tx, command_rx) = mpsc::channel::<ShellCommand>(256);
        (Self { command_tx }, command_rx)
    }

    /// Queue a terminal resize.
    pub async fn window_change(&self, cols: u16, rows: u16) -> Result<(), SshError> {
        self.command_tx
            .send(ShellCommand::WindowChange { cols, rows })
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }
}

async fn run_channel(
    mut channel: Channel<client::Msg>,
    mut command_rx: mpsc::Receiver<ShellCommand>,
    event_tx: mpsc::Sender<ShellEvent>,
    cancel: CancellationToken,
) {
    let mut exit_code: Option<u32> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Shell channel cancelled");
                break;
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if event_tx.send(ShellEvent::Output(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if event_tx.send(ShellEvent::Output(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    Some(_) => {}
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            tracing::error!("Failed to send shell data: {}", e);
                            break;
                        }
                    }
                    Some(ShellCommand::WindowChange { cols, rows }) => {
                        if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                            tracing::error!("Failed to send window change: {}", e);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = event_tx.send(ShellEvent::Closed { exit_code }).await;
}
