use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use querypilot_agent::QueryRequest;
use querypilot_common::Error;

use crate::state::{SessionEvent, SharedState};

const MAX_WS_FRAME_BYTES: usize = 64 * 1024;
const MAX_WS_MESSAGE_BYTES: usize = 256 * 1024;
const MAX_WS_TEXT_BYTES: usize = 32 * 1024;

/// Heartbeat: send ping every 30 seconds.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Close the connection if no pong received within 90 seconds.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// WebSocket upgrade handler. The bearer token (when configured) gates
/// the handshake; the `userId` query parameter is the verified identity
/// attached by the outer auth layer.
pub async fn ws_handler(
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(configured_key) = &state.config.gateway.api_key {
        let token_from_query = params.get("token").or_else(|| params.get("api_key"));
        let token_from_header = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));
        let token = token_from_query.map(|s| s.as_str()).or(token_from_header);

        // Constant-time comparison
        let valid = match token {
            Some(t) if t.len() == configured_key.len() => {
                t.bytes()
                    .zip(configured_key.bytes())
                    .fold(0, |acc, (a, b)| acc | (a ^ b))
                    == 0
            }
            _ => false,
        };

        if !valid {
            warn!("WebSocket connection rejected: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let user_id = params
        .get("userId")
        .cloned()
        .unwrap_or_else(|| "anonymous".to_string());

    ws.max_frame_size(MAX_WS_FRAME_BYTES)
        .max_message_size(MAX_WS_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Client events. Unknown `type` values become an `error` event rather
/// than closing the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinSession { session_id: String, user_id: String },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        session_id: String,
        message: String,
        #[serde(default)]
        db_url: Option<String>,
        #[serde(default)]
        db_type: Option<String>,
        #[serde(default)]
        dry_run: bool,
        #[serde(default)]
        insight: Option<bool>,
    },

    #[serde(rename_all = "camelCase")]
    Typing { session_id: String, is_typing: bool },

    #[serde(rename_all = "camelCase")]
    CreateSession {
        user_id: String,
        #[serde(default)]
        title: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ListSessions { user_id: String },

    #[serde(rename_all = "camelCase")]
    DeleteSession { session_id: String, user_id: String },
}

async fn handle_socket(socket: WebSocket, state: SharedState, verified_user: String) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Session fan-out is bridged through a per-socket channel so that a
    // join can swap the subscription without fighting the select loop.
    let (fanout_tx, mut fanout_rx) = tokio::sync::mpsc::channel::<SessionEvent>(32);
    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

    info!("websocket connected: socket={socket_id}, user={verified_user}");

    let mut last_pong = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // Don't send ping immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > HEARTBEAT_TIMEOUT {
                    warn!("heartbeat timeout: socket={socket_id}");
                    break;
                }
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            Some(event) = fanout_rx.recv() => {
                if event.origin != socket_id
                    && sender.send(Message::Text(event.payload.into())).await.is_err()
                {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_pong = Instant::now();

                        if text.len() > MAX_WS_TEXT_BYTES {
                            let err = error_event("message_too_large", "event exceeds size limit");
                            let _ = sender.send(Message::Text(err.into())).await;
                            continue;
                        }

                        let (replies, new_subscription) =
                            handle_event(&state, &socket_id, &verified_user, &text).await;

                        if let Some(subscription) = new_subscription {
                            if let Some(task) = forwarder.take() {
                                task.abort();
                            }
                            forwarder = Some(spawn_forwarder(subscription, fanout_tx.clone()));
                        }

                        let mut closed = false;
                        for reply in replies {
                            if sender.send(Message::Text(reply.into())).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket closed: socket={socket_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("websocket error: socket={socket_id}, error={e}");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    if let Some(task) = forwarder.take() {
        task.abort();
    }
}

/// Pump session broadcast events into the socket's private channel.
/// Lagged subscribers skip dropped events.
fn spawn_forwarder(
    mut subscription: broadcast::Receiver<SessionEvent>,
    fanout_tx: tokio::sync::mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if fanout_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Process one client event. Direct replies preserve per-socket order;
/// session-scoped events are additionally published to other sockets.
/// A successful join returns the new broadcast subscription.
async fn handle_event(
    state: &SharedState,
    socket_id: &str,
    verified_user: &str,
    raw: &str,
) -> (Vec<String>, Option<broadcast::Receiver<SessionEvent>>) {
    let event: ClientEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(e) => {
            return (
                vec![error_event("bad_event", &format!("unrecognized event: {e}"))],
                None,
            );
        }
    };

    match event {
        ClientEvent::JoinSession {
            session_id,
            user_id,
        } => {
            if user_id != verified_user {
                return (
                    vec![error_event("user_mismatch", "userId does not match token")],
                    None,
                );
            }
            match state.join_session(&session_id, &user_id) {
                Ok(session) => {
                    let events = state.live_session(&session_id, &user_id);
                    (
                        vec![json!({
                            "type": "session-joined",
                            "sessionId": session.id,
                            "messageCount": session.message_count,
                        })
                        .to_string()],
                        Some(events.subscribe()),
                    )
                }
                Err(e) => (vec![error_from(&e)], None),
            }
        }

        ClientEvent::SendMessage {
            session_id,
            message,
            db_url,
            db_type,
            dry_run,
            insight,
        } => {
            let request = QueryRequest {
                query: message,
                db_url,
                db_type,
                dry_run,
                refresh_schema: false,
                insight: insight.unwrap_or(false),
            };

            let mut replies = Vec::new();
            match state.send_message(&session_id, verified_user, &request).await {
                Ok((user_message, response, agent_message)) => {
                    let received = json!({
                        "type": "message-received",
                        "sessionId": session_id,
                        "message": user_message,
                    })
                    .to_string();
                    let thinking = json!({
                        "type": "agent-thinking",
                        "sessionId": session_id,
                    })
                    .to_string();
                    let answer = json!({
                        "type": "agent-response",
                        "sessionId": session_id,
                        "message": agent_message,
                        "response": response,
                    })
                    .to_string();

                    state.publish(&session_id, socket_id, received.clone());
                    state.publish(&session_id, socket_id, answer.clone());

                    replies.push(received);
                    replies.push(thinking);
                    replies.push(answer);
                }
                Err(e) => replies.push(error_from(&e)),
            }
            (replies, None)
        }

        ClientEvent::Typing {
            session_id,
            is_typing,
        } => {
            let indicator = json!({
                "type": "typing-indicator",
                "sessionId": session_id,
                "userId": verified_user,
                "isTyping": is_typing,
            })
            .to_string();
            state.publish(&session_id, socket_id, indicator);
            (Vec::new(), None)
        }

        ClientEvent::CreateSession { user_id, title } => {
            if user_id != verified_user {
                return (
                    vec![error_event("user_mismatch", "userId does not match token")],
                    None,
                );
            }
            let replies = match state.create_session(&user_id, title.as_deref()) {
                Ok(session) => vec![json!({
                    "type": "session-created",
                    "sessionId": session.id,
                    "title": session.title,
                })
                .to_string()],
                Err(e) => vec![error_from(&e)],
            };
            (replies, None)
        }

        ClientEvent::ListSessions { user_id } => {
            if user_id != verified_user {
                return (
                    vec![error_event("user_mismatch", "userId does not match token")],
                    None,
                );
            }
            let replies = match state.list_sessions(&user_id) {
                Ok(sessions) => vec![json!({
                    "type": "sessions-list",
                    "sessions": sessions,
                })
                .to_string()],
                Err(e) => vec![error_from(&e)],
            };
            (replies, None)
        }

        ClientEvent::DeleteSession {
            session_id,
            user_id,
        } => {
            if user_id != verified_user {
                return (
                    vec![error_event("user_mismatch", "userId does not match token")],
                    None,
                );
            }
            let replies = match state.delete_session(&session_id, &user_id) {
                Ok(()) => vec![json!({
                    "type": "session-deleted",
                    "sessionId": session_id,
                })
                .to_string()],
                Err(e) => vec![error_from(&e)],
            };
            (replies, None)
        }
    }
}

fn error_event(code: &str, message: &str) -> String {
    json!({
        "type": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}

fn error_from(error: &Error) -> String {
    error_event(error.kind(), &error.to_string())
}

#[cfg(test)]
mod tests {
    use super::ClientEvent;

    #[test]
    fn join_event_parses_from_kebab_case_wire_form() {
        let raw = r#"{"type": "join-session", "sessionId": "s-1", "userId": "u-1"}"#;
        let event: ClientEvent = serde_json::from_str(raw).expect("event should parse");
        match event {
            ClientEvent::JoinSession {
                session_id,
                user_id,
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(user_id, "u-1");
            }
            other => panic!("expected join-session, got {other:?}"),
        }
    }

    #[test]
    fn send_message_defaults_optional_fields() {
        let raw = r#"{"type": "send-message", "sessionId": "s-1", "message": "count users"}"#;
        let event: ClientEvent = serde_json::from_str(raw).expect("event should parse");
        match event {
            ClientEvent::SendMessage {
                db_url, dry_run, ..
            } => {
                assert!(db_url.is_none());
                assert!(!dry_run);
            }
            other => panic!("expected send-message, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_fail_to_parse() {
        let raw = r#"{"type": "shell-exec", "command": "ls"}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }
}
