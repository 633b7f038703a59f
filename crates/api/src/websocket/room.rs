//! Chat room management for pub/sub
//!
//! Every socket watching a chat joins that chat's room.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;

/// Manages chat "rooms" for broadcasting events
#[derive(Default)]
pub struct RoomManager {
    /// Map of chat_id -> connections watching it
    rooms: RwLock<HashMap<i64, Vec<Arc<Connection>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a chat room
    pub async fn join(&self, chat_id: i64, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(chat_id).or_default();
        let session_id = conn.session_id;
        room.push(conn);

        tracing::debug!(
            chat_id,
            session_id = %session_id,
            room_size = room.len(),
            "Connection joined chat room"
        );
    }

    /// Remove a connection from a chat room
    pub async fn leave(&self, chat_id: i64, session_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(&chat_id) {
            conns.retain(|c| c.session_id != *session_id);

            if conns.is_empty() {
                rooms.remove(&chat_id);
                tracing::debug!(chat_id, "Removed empty chat room");
            }
        }
    }

    /// Send an event to everyone in a chat room
    ///
    /// Connections whose channel is gone are dropped from the room afterwards.
    pub async fn broadcast(&self, chat_id: i64, event: &ServerEvent) -> usize {
        let members: Vec<Arc<Connection>> = {
            let rooms = self.rooms.read().await;
            match rooms.get(&chat_id) {
                Some(conns) => conns.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in &members {
            match conn.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(conn.session_id),
            }
        }

        if !failed.is_empty() {
            tracing::warn!(
                chat_id,
                event_type = event.event_type(),
                failed = failed.len(),
                "Dropping closed connections from chat room"
            );
            for session_id in &failed {
                self.leave(chat_id, session_id).await;
            }
        }

        tracing::debug!(
            chat_id,
            event_type = event.event_type(),
            recipients = delivered,
            "Broadcast event to chat room"
        );

        delivered
    }

    /// Remove a connection from all rooms
    pub async fn remove_connection(&self, session_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        let mut removed_from = 0;

        for conns in rooms.values_mut() {
            let before_len = conns.len();
            conns.retain(|c| c.session_id != *session_id);
            if conns.len() < before_len {
                removed_from += 1;
            }
        }

        rooms.retain(|_, conns| !conns.is_empty());

        if removed_from > 0 {
            tracing::debug!(
                session_id = %session_id,
                room_count = removed_from,
                "Removed connection from rooms"
            );
        }
    }

    pub async fn room_size(&self, chat_id: i64) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&chat_id).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
