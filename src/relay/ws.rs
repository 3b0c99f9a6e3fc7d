use axum::{
    debug_handler,
    extract::{Query, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::IntoResponse,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::registry::{ConnId, Outbound};
use crate::{AppState, auth, now_unix, stats};

use super::protocol::{ClientMessage, ServerMessage};
use super::{presence, signals, teardown};

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    pub user_handle: Option<String>,
    pub room_id: Option<String>,
    pub token: Option<String>,
    pub api_secret: Option<String>,
}

#[debug_handler(state = crate::AppState)]
pub async fn relay_ws(
    Query(query): Query<HandshakeQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |socket| {
        let verdict = auth::verify_handshake(
            query.user_handle.as_deref(),
            query.token.as_deref(),
            query.api_secret.as_deref(),
            &state.settings.broadcast_secret,
            now_unix(),
        );
        match verdict {
            Ok(()) => {
                // verify_handshake guarantees the handle is present.
                let Some(user) = query.user_handle else { return };
                let room = query
                    .room_id
                    .unwrap_or_else(|| state.settings.default_room.clone());
                handle_connection(socket, state, user, room).await;
            }
            Err(rejection) => reject(socket, rejection).await,
        }
    })
}

/// Refused handshakes get one machine-readable `error` frame and a close;
/// no registry entry is ever created for them.
async fn reject(mut socket: WebSocket, rejection: auth::Rejection) {
    warn!(reason = rejection.reason(), "handshake rejected");
    let error = ServerMessage::Error {
        message: rejection.reason().to_owned(),
    };
    if let Ok(frame) = serde_json::to_string(&error) {
        let _ = socket.send(Message::Text(frame.into())).await;
    }
    let _ = socket.close().await;
}

async fn handle_connection(socket: WebSocket, state: AppState, user: String, room: String) {
    let conn = ConnId::new();
    let (tx, mut rx) = unbounded_channel();
    let (mut sink, mut stream) = socket.split();

    // Pump: the only task that touches the socket's write half. Everything
    // else queues `Outbound` values through the registry.
    let mut pump = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let frame = match out {
                Outbound::Frame(frame) => Message::Text(frame.into()),
                Outbound::Ping => Message::Ping(Vec::new().into()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    state.registry.register(conn, &user, &room, tx).await;
    info!(%conn, %user, %room, "connection accepted");

    send_to_self(
        &state,
        conn,
        &ServerMessage::Connected {
            user_handle: user.clone(),
            room_id: room.clone(),
        },
    )
    .await;
    presence::online(&state.broadcaster, &room, &user, Some(conn)).await;

    while let Some(Ok(frame)) = stream.next().await {
        state.registry.touch(conn).await;
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_message(&state, conn, &user, msg).await,
                Err(err) => {
                    debug!(%conn, error = %err, "malformed client payload");
                    send_to_self(
                        &state,
                        conn,
                        &ServerMessage::Error {
                            message: "malformed_payload".to_owned(),
                        },
                    )
                    .await;
                }
            },
            Message::Close(_) => break,
            // Ping/pong/binary frames only refresh liveness.
            _ => {}
        }
    }

    teardown(&state.registry, &state.broadcaster, conn).await;
    // teardown queued a close frame and dropped the last sender, so the
    // pump exits once it has flushed. Abort only if it wedges on a dead
    // socket write.
    if timeout(Duration::from_secs(1), &mut pump).await.is_err() {
        pump.abort();
    }
}

async fn handle_message(state: &AppState, conn: ConnId, user: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::Ping => {
            send_to_self(state, conn, &ServerMessage::Pong).await;
        }
        ClientMessage::Typing {
            conversation_with,
            is_typing,
        } => {
            signals::typing(
                &state.db_pool,
                &state.broadcaster,
                user,
                &conversation_with,
                is_typing,
            )
            .await;
        }
        ClientMessage::ReadReceipt {
            message_id,
            from_user,
        } => {
            signals::read_receipt(
                &state.db_pool,
                &state.broadcaster,
                user,
                message_id,
                &from_user,
            )
            .await;
        }
        ClientMessage::GetStats => {
            match stats::snapshot(&state.registry, &state.db_pool, state.settings.started).await {
                Ok(snapshot) => {
                    send_to_self(state, conn, &ServerMessage::ServerStats { stats: snapshot })
                        .await;
                }
                Err(err) => {
                    warn!(%conn, error = %err, "stats snapshot failed");
                    send_to_self(
                        state,
                        conn,
                        &ServerMessage::Error {
                            message: "stats_unavailable".to_owned(),
                        },
                    )
                    .await;
                }
            }
        }
        ClientMessage::JoinRoom { room_id } => {
            // Registry first, then presence, so the announcements reflect
            // the new membership.
            let Some(old_room) = state.registry.switch_room(conn, Some(&room_id)).await else {
                return;
            };
            if let Some(old_room) = old_room {
                presence::offline(&state.broadcaster, &old_room, user, Some(conn)).await;
            }
            presence::online(&state.broadcaster, &room_id, user, Some(conn)).await;
            send_to_self(state, conn, &ServerMessage::RoomJoined { room_id }).await;
        }
        ClientMessage::LeaveRoom => {
            let Some(old_room) = state.registry.switch_room(conn, None).await else {
                return;
            };
            if let Some(old_room) = old_room {
                presence::offline(&state.broadcaster, &old_room, user, Some(conn)).await;
            }
        }
        ClientMessage::PresenceUpdate { status } => {
            if let Some(room) = state.registry.room_of(conn).await {
                presence::announce(&state.broadcaster, &room, user, &status, Some(conn)).await;
            }
        }
    }
}

async fn send_to_self(state: &AppState, conn: ConnId, msg: &ServerMessage) {
    if let Ok(frame) = serde_json::to_string(msg) {
        state.registry.send_to_conn(conn, Outbound::Frame(frame)).await;
    }
}
