//! Monitor streams: periodic binary metric frames over a pooled SSH
//! connection shared by all viewers of the same (user, server) pair.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::monitor::{Collector, PoolKey};

use super::AppState;
use super::api::user_id_from_headers;
use super::protocol::{MONITOR_CLOSE_UNREACHABLE, MonitorClientMessage, MonitorServerMessage};

const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
pub struct MonitorParams {
    interval: Option<u64>,
}

pub async fn monitor_handler(
    ws: WebSocketUpgrade,
    Path(server_id): Path<Uuid>,
    Query(params): Query<MonitorParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let user_id = match user_id_from_headers(&headers) {
        Ok(id) => id,
        Err(status) => return status.into_response(),
    };
    let interval = params
        .interval
        .unwrap_or(state.monitor.default_interval_secs)
        .clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);

    ws.on_upgrade(move |socket| stream_metrics(socket, state, user_id, server_id, interval))
}

async fn stream_metrics(
    socket: WebSocket,
    state: AppState,
    user_id: Uuid,
    server_id: Uuid,
    interval_secs: u64,
) {
    let (mut sink, mut stream) = socket.split();
    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || is_close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let key = PoolKey::new(user_id, server_id);
    let conn = match state.pool.acquire(key).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(
                "Monitor for user {} server {} failed to connect: {}",
                user_id,
                server_id,
                e
            );
            send_text(
                &ws_tx,
                &MonitorServerMessage::Error {
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

    tracing::info!(
        "Monitor stream open for user {} to server {} every {}s",
        user_id,
        server_id,
        interval_secs
    );

    let mut collector = Collector::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match collector.collect(conn.transport()).await {
                    Ok(sample) => {
                        failures = 0;
                        match sample.to_frame() {
                            Ok(frame) => {
                                if ws_tx.send(Message::Binary(frame)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::error!("Failed to encode metric frame: {}", e),
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::debug!(
                            "Metric poll {} of {} failed for server {}: {}",
                            failures,
                            state.monitor.max_consecutive_failures,
                            server_id,
                            e
                        );
                    }
                }
                if failures >= state.monitor.max_consecutive_failures {
                    tracing::warn!(
                        "Monitor target {} unreachable after {} polls; closing stream",
                        server_id,
                        failures
                    );
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: MONITOR_CLOSE_UNREACHABLE,
                            reason: "target unreachable".into(),
                        })))
                        .await;
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, &ws_tx).await;
                    }
                    Some(Ok(Message::Binary(_)))
                    | Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    drop(ws_tx);
    let _ = writer.await;
    state.pool.release(&conn).await;
    tracing::info!(
        "Monitor stream closed for user {} to server {}",
        user_id,
        server_id
    );
}

async fn handle_text(text: &str, ws_tx: &mpsc::Sender<Message>) {
    let recv_ts = chrono::Utc::now().timestamp_millis();
    match serde_json::from_str::<MonitorClientMessage>(text) {
        Ok(MonitorClientMessage::Ping { ts }) => {
            send_text(
                ws_tx,
                &MonitorServerMessage::Pong {
                    ts,
                    server_recv_ts: recv_ts,
                    server_send_ts: chrono::Utc::now().timestamp_millis(),
                },
            )
            .await;
        }
        Ok(MonitorClientMessage::Unknown) => {
            tracing::debug!("Ignoring unknown monitor message");
        }
        Err(e) => {
            tracing::debug!("Ignoring malformed monitor frame: {}", e);
        }
    }
}

async fn send_text(ws_tx: &mpsc::Sender<Message>, msg: &MonitorServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = ws_tx.send(Message::Text(json)).await;
        }
        Err(e) => tracing::error!("Failed to encode monitor frame: {}", e),
    }
}
