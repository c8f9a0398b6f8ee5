//! The terminal relay: one WebSocket bridged to one remote shell.
//!
//! Output bytes travel as binary frames with no envelope; control messages
//! are JSON text frames. Every write to the socket goes through one writer
//! task, because concurrent writers corrupt WebSocket framing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SshError;
use crate::registry::{SessionRegistry, TerminalSession};
use crate::ssh::{ShellChannel, ShellEvent, Transport};

use super::AppState;
use super::api::user_id_from_headers;
use super::protocol::{ClientControl, ServerControl};

const PING_INTERVAL: Duration = Duration::from_secs(50);
const PONG_DEADLINE: Duration = Duration::from_secs(60);
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Deserialize)]
pub struct TerminalParams {
    cols: Option<u16>,
    rows: Option<u16>,
}

pub async fn terminal_handler(
    ws: WebSocketUpgrade,
    Path(server_id): Path<Uuid>,
    Query(params): Query<TerminalParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let user_id = match user_id_from_headers(&headers) {
        Ok(id) => id,
        Err(status) => return status.into_response(),
    };
    let cols = params.cols.unwrap_or(DEFAULT_COLS).max(1);
    let rows = params.rows.unwrap_or(DEFAULT_ROWS).max(1);

    ws.on_upgrade(move |socket| relay(socket, state, user_id, server_id, cols, rows))
}

/// Everything needed to pump one established session.
#[derive(Debug)]
struct Established {
    session_id: Uuid,
    transport: Transport,
    shell: ShellChannel,
    shell_events: mpsc::Receiver<ShellEvent>,
    cancel: CancellationToken,
}

async fn relay(
    socket: WebSocket,
    state: AppState,
    user_id: Uuid,
    server_id: Uuid,
    cols: u16,
    rows: u16,
) {
    let (mut sink, stream) = socket.split();

    // Single serialized write path; the writer task owns the sink.
    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let established = match establish(&state, user_id, server_id, cols, rows).await {
        Ok(established) => established,
        Err(e) => {
            tracing::warn!(
                "Terminal for user {} server {} failed: {}",
                user_id,
                server_id,
                e
            );
            send_control(
                &ws_tx,
                &ServerControl::Error {
                    error: e.code().to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            drop(ws_tx);
            let _ = writer.await;
            return;
        }
    };

    let Established {
        session_id,
        transport,
        shell,
        shell_events,
        cancel,
    } = established;

    send_control(&ws_tx, &ServerControl::Connected { session_id }).await;
    tracing::info!(
        "Terminal session {} open for user {} to server {}",
        session_id,
        user_id,
        server_id
    );

    // The pump runs in its own task so a panic in it cannot skip the
    // teardown sequence below.
    let pump = tokio::spawn(pump(
        stream,
        shell_events,
        shell,
        cancel,
        ws_tx.clone(),
        Arc::clone(&state.registry),
        session_id,
    ));
    if let Some(frame) = pump_failure(pump.await) {
        tracing::error!("Terminal pump for session {} panicked", session_id);
        send_control(&ws_tx, &frame).await;
    }

    // Removing from the registry fires the cancel token, which unwinds the
    // channel task; both are idempotent, so concurrent triggers are safe.
    state.registry.remove(session_id);
    send_control(&ws_tx, &ServerControl::Closed).await;
    drop(ws_tx);
    transport.disconnect().await;
    let _ = writer.await;
    tracing::info!("Terminal session {} closed", session_id);
}

async fn pump(
    mut stream: SplitStream<WebSocket>,
    mut shell_events: mpsc::Receiver<ShellEvent>,
    shell: ShellChannel,
    cancel: CancellationToken,
    ws_tx: mpsc::Sender<Message>,
    registry: Arc<SessionRegistry>,
    session_id: Uuid,
) {
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Session {} closed externally", session_id);
                break;
            }
            event = shell_events.recv() => {
                match event {
                    Some(ShellEvent::Output(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(ShellEvent::Closed { exit_code }) => {
                        tracing::debug!(
                            "Shell for session {} closed (exit {:?})",
                            session_id,
                            exit_code
                        );
                        break;
                    }
                    None => break,
                }
            }
            frame = stream.next() => {
                last_seen = Instant::now();
                match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        if shell.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if handle_control(&text, &registry, session_id, &shell, &ws_tx).await.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            _ = ping_ticker.tick() => {
                if last_seen.elapsed() > PONG_DEADLINE {
                    tracing::warn!("Session {} missed keepalive; closing", session_id);
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Map the pump's join result to the error frame owed to the client. A
/// normal exit and a cancelled task both owe nothing.
fn pump_failure(result: Result<(), tokio::task::JoinError>) -> Option<ServerControl> {
    match result {
        Ok(()) => None,
        Err(e) if e.is_panic() => Some(ServerControl::Error {
            error: "internal_error".to_string(),
            message: "terminal relay failed".to_string(),
        }),
        Err(_) => None,
    }
}

async fn establish(
    state: &AppState,
    user_id: Uuid,
    server_id: Uuid,
    cols: u16,
    rows: u16,
) -> Result<Established, SshError> {
    let descriptor = state
        .directory
        .resolve(user_id, server_id)
        .await
        .map_err(|e| SshError::ConnectionFailed {
            host: server_id.to_string(),
            port: 0,
            reason: e.to_string(),
        })?;

    // Parallel sessions to the same server are allowed; note them so an
    // operator can tell duplicates from reconnect loops in the logs.
    if let Some(existing) = state
        .registry
        .find_active_by_user_and_server(user_id, server_id)
    {
        tracing::info!(
            "User {} already has session {} to server {}; opening another",
            user_id,
            existing.id,
            server_id
        );
    }

    let host = descriptor.host.clone();
    let port = descriptor.port;
    let transport = state.terminal_client.connect(descriptor).await?;

    let session = TerminalSession::new(user_id, server_id, host, port, cols, rows);
    let session_id = session.id;
    let cancel = session.cancel_token();

    let (event_tx, shell_events) = mpsc::channel(256);
    let shell = match transport
        .open_shell(cols, rows, event_tx, cancel.clone())
        .await
    {
        Ok(shell) => shell,
        Err(e) => {
            transport.disconnect().await;
            return Err(e);
        }
    };

    state.registry.add(session);

    Ok(Established {
        session_id,
        transport,
        shell,
        shell_events,
        cancel,
    })
}

async fn handle_control(
    text: &str,
    registry: &SessionRegistry,
    session_id: Uuid,
    shell: &ShellChannel,
    ws_tx: &mpsc::Sender<Message>,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    let control = match serde_json::from_str::<ClientControl>(text) {
        Ok(control) => control,
        Err(e) => {
            // Malformed control frames are a protocol nuisance, not fatal.
            tracing::debug!("Ignoring malformed control frame: {}", e);
            return ControlFlow::Continue(());
        }
    };

    match control {
        ClientControl::Input(data) => {
            if shell.send(data.into_bytes()).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        ClientControl::Resize { cols, rows } => {
            // Window-change goes out before any input read after it.
            if shell.window_change(cols, rows).await.is_err() {
                return ControlFlow::Break(());
            }
            registry.update_size(session_id, cols, rows);
        }
        ClientControl::Ping => {
            send_control(ws_tx, &ServerControl::Pong).await;
        }
        ClientControl::Close => return ControlFlow::Break(()),
        ClientControl::Unknown => {
            tracing::debug!("Ignoring unknown control type");
        }
    }
    ControlFlow::Continue(())
}

async fn send_control(ws_tx: &mpsc::Sender<Message>, control: &ServerControl) {
    match serde_json::to_string(control) {
        Ok(json) => {
            let _ = ws_tx.send(Message::Text(json)).await;
        }
        Err(e) => tracing::error!("Failed to encode control frame: {}", e),
    }
}

// The protocol-level behavior of the relay (envelope shapes, registry
// bookkeeping) is covered in protocol.rs and registry.rs; the ssh layer is
// covered in ssh::shell. What remains here is the wiring itself.
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn establish_fails_cleanly_for_unknown_server() {
        let state = crate::server::tests::test_state();
        let err = establish(&state, Uuid::new_v4(), Uuid::new_v4(), 80, 24)
            .await
            .expect_err("no directory entry");
        assert_eq!(err.code(), "unreachable");
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test]
    async fn panicked_pump_produces_error_frame() {
        let result = tokio::spawn(async { panic!("pump blew up") }).await;
        let frame = pump_failure(result).expect("panic must surface a frame");
        match frame {
            ServerControl::Error { error, .. } => assert_eq!(error, "internal_error"),
            other => panic!("unexpected frame: {other:?}"),
        }

        let result = tokio::spawn(async {}).await;
        assert!(pump_failure(result).is_none());
    }

    #[tokio::test]
    async fn repeated_resize_issues_window_change_each_time() {
        use crate::registry::TerminalSession;
        use crate::ssh::shell::ShellCommand;

        let state = crate::server::tests::test_state();
        let session =
            TerminalSession::new(Uuid::new_v4(), Uuid::new_v4(), "10.0.0.5".into(), 22, 80, 24);
        let session_id = session.id;
        state.registry.add(session);

        let (shell, mut commands) = ShellChannel::for_tests();
        let (ws_tx, _ws_rx) = mpsc::channel::<Message>(8);
        let frame = r#"{"type":"resize","data":{"cols":120,"rows":40}}"#;

        for _ in 0..2 {
            let flow = handle_control(frame, &state.registry, session_id, &shell, &ws_tx).await;
            assert!(flow.is_continue());
            match commands.recv().await {
                Some(ShellCommand::WindowChange { cols, rows }) => {
                    assert_eq!((cols, rows), (120, 40));
                }
                other => panic!("expected window change, got {other:?}"),
            }
        }

        let info = state.registry.get(session_id).expect("session registered");
        assert_eq!((info.cols, info.rows), (120, 40));
    }
}
