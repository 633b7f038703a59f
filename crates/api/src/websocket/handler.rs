//! WebSocket handlers for Axum
//!
//! `/ws` is the privileged presence gateway; `/ws/chats/:chat_id` streams one
//! chat's room events to its client or to staff. Both authenticate with the
//! `token` query parameter after the upgrade and close with a policy
//! violation when the caller may not connect.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream, StreamExt},
    SinkExt,
};
use livechat_shared::ChatSummary;
use serde::Deserialize;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use super::{
    connection::Connection,
    events::{ClientFrame, ServerEvent},
    presence::Registration,
};
use crate::{auth::Identity, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: String,
}

/// Gate for the presence channel: known, privileged identities only
fn authorize_presence(resolved: Result<Identity, ApiError>) -> Result<Identity, CloseFrame<'static>> {
    match resolved {
        Ok(identity) if identity.is_privileged() => Ok(identity),
        Ok(identity) => {
            tracing::warn!(user_id = identity.user_id, role = identity.role.as_str(), "Presence socket rejected: role");
            Err(policy_violation("operator or supervisor role required"))
        }
        Err(ApiError::Database(_)) | Err(ApiError::Internal) => Err(CloseFrame {
            code: close_code::ERROR,
            reason: "internal error".into(),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Presence socket rejected: authentication");
            Err(policy_violation("authentication failed"))
        }
    }
}

/// Clients may watch their own chats, staff may watch any
fn may_watch(identity: &Identity, chat: &ChatSummary) -> bool {
    identity.is_privileged() || chat.client_id == identity.user_id
}

fn policy_violation(reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    }
}

/// Sent to a presence socket displaced by a newer one for the same user
fn replaced_frame() -> CloseFrame<'static> {
    CloseFrame {
        code: close_code::NORMAL,
        reason: "replaced by a newer connection".into(),
    }
}

async fn reject(mut socket: WebSocket, frame: CloseFrame<'static>) {
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Presence gateway upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let resolved = app_state.auth_state().resolve(&params.token).await;
        match authorize_presence(resolved) {
            Ok(identity) => handle_presence_socket(socket, identity, app_state).await,
            Err(frame) => reject(socket, frame).await,
        }
    })
}

/// Chat room stream upgrade
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let identity = match app_state.auth_state().resolve(&params.token).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "Chat socket rejected: authentication");
                return reject(socket, policy_violation("authentication failed")).await;
            }
        };

        match app_state.chats.get(chat_id).await {
            Ok(Some(chat)) if may_watch(&identity, &chat) => {
                handle_room_socket(socket, identity, chat_id, app_state).await
            }
            Ok(_) => {
                tracing::warn!(chat_id, user_id = identity.user_id, "Chat socket rejected: access");
                reject(socket, policy_violation("chat not accessible")).await
            }
            Err(e) => {
                tracing::error!(chat_id, error = %e, "Chat socket lookup failed");
                reject(
                    socket,
                    CloseFrame {
                        code: close_code::ERROR,
                        reason: "internal error".into(),
                    },
                )
                .await
            }
        }
    })
}

/// Forward queued events to the socket until either side goes away
///
/// Events queued before a close request are still delivered; the socket
/// then ends with `close_frame`.
fn spawn_send_task(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: Arc<Notify>,
    close_frame: CloseFrame<'static>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.notified() => {
                    let _ = sender.send(Message::Close(Some(close_frame.clone()))).await;
                    break;
                }
            };

            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, event_type = event.event_type(), "Failed to serialize WebSocket event");
                }
            }
        }
    })
}

/// Read frames until close; answers pings and runs `on_ping` for each
async fn read_loop<F, Fut>(mut receiver: SplitStream<WebSocket>, conn: &Connection, mut on_ping: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(ClientFrame::Ping) = serde_json::from_str::<ClientFrame>(&text) {
                    on_ping().await;
                    let _ = conn.send(ServerEvent::Pong);
                }
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(session_id = %conn.session_id, "WebSocket close frame received");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session_id = %conn.session_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }
}

async fn handle_presence_socket(socket: WebSocket, identity: Identity, app_state: AppState) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();

    let user_id = identity.user_id;
    let conn = Arc::new(Connection::new(user_id, identity.role, tx));
    let session_id = conn.session_id;
    let broadcaster = app_state.broadcaster.clone();
    let presence = Arc::clone(broadcaster.presence());

    if let Registration::Replaced(old) = presence.register(Arc::clone(&conn)).await {
        tracing::info!(user_id, old_session_id = %old.session_id, "Closing displaced presence socket");
        let _ = old.send(ServerEvent::Error {
            message: "Replaced by a newer connection".to_string(),
        });
        old.close();
    }

    let send_task = spawn_send_task(sender, rx, conn.shutdown_signal(), replaced_frame());

    match app_state.chats.stats().await {
        Ok(stats) => {
            let online = presence.online_users(Some(user_id)).await;
            let _ = conn.send(ServerEvent::presence_snapshot(stats, online));
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Failed to build presence snapshot");
            let _ = conn.send(ServerEvent::Error {
                message: "Presence snapshot unavailable".to_string(),
            });
        }
    }

    broadcaster.user_online(user_id, identity.role).await;
    tracing::info!(user_id, session_id = %session_id, "Presence socket connected");

    read_loop(receiver, &conn, || {
        let presence = Arc::clone(&presence);
        async move {
            presence.touch(user_id, session_id).await;
        }
    })
    .await;

    // Same cleanup on every exit path
    tracing::info!(user_id, session_id = %session_id, "Presence socket closing");
    broadcaster.rooms().remove_connection(&session_id).await;
    if let Some(last_seen) = presence.unregister(user_id, session_id).await {
        broadcaster.user_offline(user_id, last_seen).await;
    }

    send_task.abort();
}

async fn handle_room_socket(socket: WebSocket, identity: Identity, chat_id: i64, app_state: AppState) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn = Arc::new(Connection::new(identity.user_id, identity.role, tx));
    let session_id = conn.session_id;
    let rooms = Arc::clone(app_state.broadcaster.rooms());

    rooms.join(chat_id, Arc::clone(&conn)).await;
    let send_task = spawn_send_task(
        sender,
        rx,
        conn.shutdown_signal(),
        CloseFrame {
            code: close_code::NORMAL,
            reason: "closed".into(),
        },
    );
    tracing::info!(chat_id, user_id = identity.user_id, session_id = %session_id, "Chat socket connected");

    read_loop(receiver, &conn, || async {}).await;

    tracing::info!(chat_id, session_id = %session_id, "Chat socket closing");
    rooms.remove_connection(&session_id).await;
    send_task.abort();
}
