//! Event fan-out to users, privileged dashboards and chat rooms
//!
//! Delivery is best effort. A failed send is logged and the stale handle is
//! purged; callers never see delivery errors. With a relay configured every
//! delivery is published and performed by each instance's subscriber.

use std::sync::Arc;

use livechat_shared::{ChatStats, ChatSummary, MessageView, ReactionOutcome, SweptChat, UserRole};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::events::ServerEvent;
use super::presence::PresenceTracker;
use super::relay::RedisRelay;
use super::room::RoomManager;

/// Who receives an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Audience {
    /// One user's live presence connection
    User { user_id: i64 },
    /// Every privileged connection, optionally minus one user
    Global { exclude: Option<i64> },
    /// Everyone watching a chat
    Room { chat_id: i64 },
}

/// An addressed event, as carried over the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub audience: Audience,
    pub event: ServerEvent,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    presence: Arc<PresenceTracker>,
    rooms: Arc<RoomManager>,
    relay: Option<RedisRelay>,
}

impl EventBroadcaster {
    pub fn new(presence: Arc<PresenceTracker>, rooms: Arc<RoomManager>) -> Self {
        Self {
            presence,
            rooms,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: RedisRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    pub async fn unicast(&self, user_id: i64, event: ServerEvent) {
        self.dispatch(Audience::User { user_id }, event).await;
    }

    pub async fn broadcast(&self, event: ServerEvent, exclude: Option<i64>) {
        self.dispatch(Audience::Global { exclude }, event).await;
    }

    /// Send to a chat room, mirroring globally for events that dashboards track
    pub async fn emit(&self, chat_id: i64, event: ServerEvent) {
        if event.global_mirror() {
            self.dispatch(Audience::Global { exclude: None }, event.clone())
                .await;
        }
        self.dispatch(Audience::Room { chat_id }, event).await;
    }

    async fn dispatch(&self, audience: Audience, event: ServerEvent) {
        let envelope = Envelope { audience, event };

        if let Some(relay) = &self.relay {
            match relay.publish(&envelope).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        event_type = envelope.event.event_type(),
                        "Relay publish failed, delivering locally"
                    );
                }
            }
        }

        self.deliver_local(&envelope).await;
    }

    /// Deliver to connections held by this instance; returns the recipient count
    pub async fn deliver_local(&self, envelope: &Envelope) -> usize {
        let event = &envelope.event;
        match envelope.audience {
            Audience::User { user_id } => {
                let Some(conn) = self.presence.connection_for(user_id).await else {
                    return 0;
                };
                match conn.send(event.clone()) {
                    Ok(()) => 1,
                    Err(_) => {
                        tracing::warn!(
                            user_id,
                            session_id = %conn.session_id,
                            event_type = event.event_type(),
                            "Unicast failed, purging connection"
                        );
                        self.presence.purge(user_id, conn.session_id).await;
                        0
                    }
                }
            }
            Audience::Global { exclude } => {
                let connections = self.presence.snapshot().await;
                let mut delivered = 0;
                let mut stale = Vec::new();

                for conn in connections.iter().filter(|c| Some(c.user_id) != exclude) {
                    match conn.send(event.clone()) {
                        Ok(()) => delivered += 1,
                        Err(_) => stale.push((conn.user_id, conn.session_id)),
                    }
                }

                for (user_id, session_id) in &stale {
                    tracing::warn!(
                        user_id = *user_id,
                        session_id = %session_id,
                        event_type = event.event_type(),
                        "Broadcast failed, purging connection"
                    );
                    self.presence.purge(*user_id, *session_id).await;
                }

                tracing::debug!(
                    event_type = event.event_type(),
                    recipients = delivered,
                    excluded = ?exclude,
                    "Broadcast event"
                );
                delivered
            }
            Audience::Room { chat_id } => self.rooms.broadcast(chat_id, event).await,
        }
    }

    // =========================================================================
    // Event catalog
    // =========================================================================

    pub async fn chat_created(&self, chat: &ChatSummary) {
        self.broadcast(ServerEvent::ChatNew { chat: chat.clone() }, None)
            .await;
    }

    /// The operator hears it directly, everyone else on the dashboard and the room
    pub async fn chat_assigned(&self, chat: &ChatSummary, operator_id: i64) {
        let event = ServerEvent::ChatAssigned {
            chat_id: chat.id,
            operator_id,
            chat: chat.clone(),
        };

        self.unicast(operator_id, event.clone()).await;
        self.broadcast(event.clone(), Some(operator_id)).await;
        self.dispatch(Audience::Room { chat_id: chat.id }, event).await;
    }

    pub async fn chat_inactive(&self, chat: &SweptChat) {
        self.emit(
            chat.id,
            ServerEvent::ChatInactive {
                chat_id: chat.id,
                client_id: chat.client_id,
                previous_operator_id: chat.previous_operator_id,
            },
        )
        .await;
    }

    /// Full message to the room, a notice to dashboards
    pub async fn message_created(&self, message: &MessageView) {
        self.broadcast(
            ServerEvent::ChatMessage {
                chat_id: message.chat_id,
                message_id: message.id,
                sender_type: message.sender_type,
                text: message.text.clone(),
            },
            None,
        )
        .await;
        self.emit(
            message.chat_id,
            ServerEvent::MessageNew {
                message: message.clone(),
            },
        )
        .await;
    }

    pub async fn message_edited(&self, message: &MessageView) {
        self.emit(
            message.chat_id,
            ServerEvent::MessageEdited {
                message: message.clone(),
            },
        )
        .await;
    }

    pub async fn reaction_changed(&self, outcome: &ReactionOutcome, user_id: i64) {
        self.emit(
            outcome.chat_id,
            ServerEvent::MessageReaction {
                chat_id: outcome.chat_id,
                message_id: outcome.message_id,
                user_id,
                action: outcome.action,
                reactions: outcome.reactions.clone(),
            },
        )
        .await;
    }

    pub async fn messages_read(&self, chat_id: i64, user_id: i64, message_id: Option<i64>, marked: u64) {
        self.emit(
            chat_id,
            ServerEvent::MessageRead {
                chat_id,
                user_id,
                message_id,
                marked,
            },
        )
        .await;
    }

    pub async fn stats_changed(&self, stats: ChatStats) {
        self.broadcast(ServerEvent::stats_changed(stats), None).await;
    }

    pub async fn user_online(&self, user_id: i64, role: UserRole) {
        self.broadcast(ServerEvent::UserOnline { user_id, role }, Some(user_id))
            .await;
    }

    pub async fn user_offline(&self, user_id: i64, last_seen: OffsetDateTime) {
        self.broadcast(ServerEvent::UserOffline { user_id, last_seen }, Some(user_id))
            .await;
    }

    /// Push an event from another subsystem into a chat room
    pub async fn inject(&self, chat_id: i64, event_type: impl Into<String>, payload: serde_json::Value) {
        let event_type = event_type.into();
        tracing::info!(chat_id, event_type = %event_type, "Injecting chat event");
        self.emit(
            chat_id,
            ServerEvent::ChatEvent {
                chat_id,
                event_type,
                payload,
            },
        )
        .await;
    }
}
