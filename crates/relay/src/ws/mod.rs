use crate::auth::{jwt::JwtAccessTokenService, middleware::bearer_token};
use crate::chat::session::ConnectionSession;
use crate::chat::ChatHub;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::metrics;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use murmur_common::protocol::chat::OutboundEvent;
use murmur_common::types::RoomName;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: usize = 65_536;

/// Ping cadence, and how long a ping may stay unanswered before the
/// connection is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

#[derive(Clone)]
struct ChatSocketState {
    hub: ChatHub,
    jwt_service: Arc<JwtAccessTokenService>,
    heartbeat: Heartbeat,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

pub fn router(hub: ChatHub, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    router_with_heartbeat(hub, jwt_service, Heartbeat::default())
}

fn router_with_heartbeat(
    hub: ChatHub,
    jwt_service: Arc<JwtAccessTokenService>,
    heartbeat: Heartbeat,
) -> Router {
    Router::new()
        .route("/ws/chat/{room}", get(ws_upgrade))
        .with_state(ChatSocketState { hub, jwt_service, heartbeat })
}

async fn ws_upgrade(
    Path(room): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<ChatSocketState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let room = match RoomName::parse(&room) {
        Ok(room) => room,
        Err(error) => {
            return RelayError::new(ErrorCode::ValidationFailed, error.to_string()).into_response()
        }
    };

    // `?token=` takes precedence over the Authorization header.
    let token = query
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers));
    let principal = state.jwt_service.principal_for(token);
    let request_id = request_id_from_headers_or_generate(&headers);

    // Joined before the 101 goes out. A failed upgrade drops the session,
    // which leaves its groups again.
    let (session, outbound) = state.hub.open_session(room, principal);
    let heartbeat = state.heartbeat;

    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(socket, session, outbound, heartbeat))
                .await;
        })
        .into_response()
}

async fn handle_socket(
    mut socket: WebSocket,
    mut session: ConnectionSession,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    heartbeat: Heartbeat,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let session_id = session.id();

    metrics::connection_opened();
    info!(
        session_id = %session_id,
        request_id = %request_id,
        user_id = session.principal().user_id(),
        groups = session.joined_groups().len(),
        "chat connection opened"
    );

    let mut heartbeat_interval = tokio::time::interval(heartbeat.interval);
    heartbeat_interval.reset();
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                pong_deadline.get_or_insert_with(|| Instant::now() + heartbeat.timeout);
            }
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                warn!(
                    session_id = %session_id,
                    request_id = %request_id,
                    "heartbeat timeout, disconnecting"
                );
                break;
            }
            maybe_outbound = outbound.recv() => {
                let Some(event) = maybe_outbound else {
                    break;
                };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        session.receive(raw.as_str());
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        pong_deadline = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {}
                    Err(_) => break,
                }
            }
        }
    }

    session.close();
    metrics::connection_closed();
    info!(session_id = %session_id, request_id = %request_id, "chat connection closed");
}

async fn send_event(socket: &mut WebSocket, event: &OutboundEvent) -> Result<(), ()> {
    let encoded = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
