use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::api::AppState;
use crate::broker::{pipeline, ToClient};
use crate::error::close_code;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
pub struct BrokerQuery {
    pub token: String,
    #[serde(rename = "slotId")]
    pub slot_id: Option<String>,
}

/// `/ws` — C7. Validates the token, resolves or creates the target slot,
/// and runs the bidirectional forwarder.
pub async fn broker_ws(
    State(state): State<AppState>,
    Query(query): Query<BrokerQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.token.matches(&query.token) {
        return ws.on_upgrade(|socket| close_immediately(socket, close_code::BAD_TOKEN, "bad token"));
    }
    ws.on_upgrade(move |socket| handle_broker(socket, state, query.slot_id))
}

async fn close_immediately(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

async fn handle_broker(socket: WebSocket, state: AppState, slot_id: Option<String>) {
    let slot = match slot_id {
        Some(id) => state.registry.get_or_respawn(&id, &state.config).await,
        None => {
            state
                .registry
                .create_slot(state.config.default_cwd.clone(), &state.config)
                .await
        }
    };
    let slot = match slot {
        Ok(slot) => slot,
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve slot for broker attachment");
            close_immediately(socket, close_code::INTERNAL_ERROR, "internal error").await;
            return;
        }
    };

    let attachment = slot.attach().await;
    let attachment_id = attachment.id;
    let mut to_client_rx = slot.subscribe();
    let mut close_rx = attachment.close_rx;

    let (mut sink, mut stream) = socket.split();

    let outbound = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                code = &mut close_rx => {
                    let code = code.unwrap_or(close_code::CLEAN);
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: Utf8Bytes::from_static("replaced") })))
                        .await;
                    break;
                }
                msg = to_client_rx.recv() => {
                    match msg {
                        Ok(ToClient::Frame(frame)) => {
                            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(ToClient::Died) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::SUBPROCESS_DIED,
                                    reason: Utf8Bytes::from_static("subprocess died"),
                                })))
                                .await;
                            break;
                        }
                        Ok(ToClient::HandshakeFailed) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::INTERNAL_ERROR,
                                    reason: Utf8Bytes::from_static("handshake failed"),
                                })))
                                .await;
                            break;
                        }
                        Ok(ToClient::Shutdown) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::SHUTDOWN,
                                    reason: Utf8Bytes::from_static("server shutting down"),
                                })))
                                .await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "broker WS subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(frame) => pipeline::handle_client_frame(&slot, frame).await,
                Err(_) => {
                    // Malformed JSON is tolerated by passing it through
                    // unchanged rather than crashing the connection.
                    slot.send_to_subprocess(&text).await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound.abort();
    slot.detach_if_current(attachment_id).await;
}
