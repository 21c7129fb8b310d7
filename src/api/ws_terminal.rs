use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::api::ws_broker::KEEPALIVE_INTERVAL;
use crate::api::AppState;
use crate::channel::PtyChannel;
use crate::error::close_code;

#[derive(Deserialize)]
pub struct TerminalQuery {
    pub token: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Data { data: String },
    Resize { cols: u16, rows: u16 },
}

/// `/ws/terminal` — C9. One socket, one PTY; the PTY dies with the socket
/// rather than surviving reconnects (the opposite lifecycle of C3's
/// subprocess slots).
pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.token.matches(&query.token) {
        return ws.on_upgrade(|socket| close_immediately(socket, close_code::BAD_TOKEN));
    }
    ws.on_upgrade(move |socket| handle_terminal(socket, state));
}

async fn close_immediately(mut socket: WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static("bad token"),
        })))
        .await;
}

async fn handle_terminal(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let (pty, mut output_rx) = match PtyChannel::spawn(&state.config.default_cwd, 80, 24) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = %e, "failed to spawn terminal PTY");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::INTERNAL_ERROR,
                    reason: Utf8Bytes::from_static("failed to start terminal"),
                })))
                .await;
            return;
        }
    };
    let pty = Arc::new(Mutex::new(pty));

    let writer_task = tokio::spawn({
        let pty = pty.clone();
        async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    biased;
                    data = output_rx.recv() => {
                        match data {
                            Some(bytes) => {
                                let frame = json!({ "type": "data", "data": STANDARD.encode(&bytes) });
                                if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let code = {
                                    let mut p = pty.lock().await;
                                    p.try_exit_code().unwrap_or(0)
                                };
                                let frame = json!({ "type": "exit", "code": code });
                                let _ = sink.send(Message::Text(frame.to_string().into())).await;
                                break;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Data { data }) => {
                    if let Ok(bytes) = STANDARD.decode(&data) {
                        let p = pty.lock().await;
                        let _ = p.write(&bytes);
                    }
                }
                Ok(ClientFrame::Resize { cols, rows }) => {
                    let p = pty.lock().await;
                    let _ = p.resize(cols, rows);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "malformed terminal frame from client, ignoring");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer_task.abort();
    pty.lock().await.kill();
    tracing::info!("terminal WebSocket disconnected, PTY killed");
}
