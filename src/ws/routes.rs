//! WebSocket attach point
//!
//! `GET /ws?sessionId=<uuid>` upgrades into a long-lived observer
//! connection. The identifier shape is validated and the session's
//! existence verified before the observer joins the fan-out; failures are
//! reported as an `ERROR` frame and the socket is closed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use super::messages::{ClientMessage, ServerMessage};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, raw_session_id: String) {
    let session_id = match raw_session_id.parse::<Uuid>() {
        Ok(id) => id,
        Err(_) => {
            send_error(&mut socket, &state, None, "INVALID_SESSION_ID", "sessionId must be a UUID")
                .await;
            return;
        }
    };

    match state.store.get(session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            send_error(
                &mut socket,
                &state,
                Some(session_id),
                "SESSION_NOT_FOUND",
                "no such session",
            )
            .await;
            return;
        }
        Err(e) => {
            send_error(&mut socket, &state, Some(session_id), e.code(), &e.to_string()).await;
            return;
        }
    }

    let mut handle = state.gateway.register(session_id);
    let connected = ServerMessage::Connected {
        session_id,
        timestamp: state.clock.now_ms(),
    };
    if send_message(&mut socket, &state, &connected).await.is_err() {
        state.gateway.unregister(session_id, handle.observer_id);
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat_interval_ms));
    heartbeat.tick().await; // immediate first tick
    let mut missed_pongs: u8 = 0;

    loop {
        tokio::select! {
            frame = handle.rx.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Gateway dropped us (slow observer or shutdown)
                    None => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_frame(&mut sender, &state, session_id, &text)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }

            _ = heartbeat.tick() => {
                if missed_pongs >= 2 {
                    tracing::debug!(session_id = %session_id, observer_id = handle.observer_id,
                        "observer missed two heartbeats, closing");
                    break;
                }
                missed_pongs += 1;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.gateway.unregister(session_id, handle.observer_id);
}

/// PING → PONG with server timestamp; RECONNECT → fresh state as
/// `STATE_SYNC` (current state only, no event replay)
async fn handle_client_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    session_id: Uuid,
    text: &str,
) -> Result<(), ()> {
    let frame = match serde_json::from_str::<ClientMessage>(text) {
        Ok(frame) => frame,
        Err(_) => {
            let msg = ServerMessage::Error {
                session_id: Some(session_id),
                timestamp: state.clock.now_ms(),
                code: "UNSUPPORTED_MESSAGE".into(),
                message: "expected PING or RECONNECT".into(),
            };
            return send_frame(sender, state, &msg).await;
        }
    };

    match frame {
        ClientMessage::Ping => {
            let msg = ServerMessage::Pong {
                session_id,
                timestamp: state.clock.now_ms(),
            };
            send_frame(sender, state, &msg).await
        }
        ClientMessage::Reconnect => {
            match state.store.get(session_id).await {
                Ok(Some(current)) => {
                    let msg = ServerMessage::StateSync {
                        session_id,
                        timestamp: state.clock.now_ms(),
                        state: Box::new(current),
                    };
                    send_frame(sender, state, &msg).await
                }
                Ok(None) => {
                    let msg = ServerMessage::SessionDeleted {
                        session_id,
                        timestamp: state.clock.now_ms(),
                    };
                    send_frame(sender, state, &msg).await
                }
                Err(e) => {
                    let msg = ServerMessage::Error {
                        session_id: Some(session_id),
                        timestamp: state.clock.now_ms(),
                        code: e.code().into(),
                        message: e.to_string(),
                    };
                    send_frame(sender, state, &msg).await
                }
            }
        }
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    message: &ServerMessage,
) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(message) else {
        return Err(());
    };
    state
        .metrics
        .ws_messages_total
        .with_label_values(&[message.kind()])
        .inc();
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

async fn send_message(socket: &mut WebSocket, state: &AppState, message: &ServerMessage) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(message) else {
        return Err(());
    };
    state
        .metrics
        .ws_messages_total
        .with_label_values(&[message.kind()])
        .inc();
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

async fn send_error(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: Option<Uuid>,
    code: &str,
    message: &str,
) {
    let frame = ServerMessage::Error {
        session_id,
        timestamp: state.clock.now_ms(),
        code: code.into(),
        message: message.into(),
    };
    let _ = send_message(socket, state, &frame).await;
    let _ = socket.send(Message::Close(None)).await;
}
