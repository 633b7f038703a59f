//! WebSocket event types and serialization
//!
//! `ServerEvent` is the single schema for everything pushed to sockets and
//! everything carried over the cross-instance relay. The `type` tag holds the
//! dotted wire name.

use livechat_shared::{
    ChatStats, ChatSummary, MessageView, OperatorLoad, ReactionAction, ReactionGroup, SenderType,
    UserRole,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// Client-to-Server Frames
// =============================================================================

/// Frames accepted from clients; anything else is ignored
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keepalive; answered with `pong`
    Ping,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A chat entered the active set
    #[serde(rename = "chat.new")]
    ChatNew { chat: ChatSummary },

    #[serde(rename = "chat.assigned")]
    ChatAssigned {
        chat_id: i64,
        operator_id: i64,
        chat: ChatSummary,
    },

    /// Closed manually or by the inactivity sweep
    #[serde(rename = "chat.inactive")]
    ChatInactive {
        chat_id: i64,
        client_id: i64,
        previous_operator_id: Option<i64>,
    },

    /// Dashboard notice that a chat received a message
    #[serde(rename = "chat.message")]
    ChatMessage {
        chat_id: i64,
        message_id: i64,
        sender_type: SenderType,
        text: String,
    },

    #[serde(rename = "message.new")]
    MessageNew { message: MessageView },

    #[serde(rename = "message.edited")]
    MessageEdited { message: MessageView },

    #[serde(rename = "message.reaction")]
    MessageReaction {
        chat_id: i64,
        message_id: i64,
        user_id: i64,
        action: ReactionAction,
        reactions: Vec<ReactionGroup>,
    },

    /// Read receipts; `message_id` is absent for a whole-chat mark
    #[serde(rename = "message.read")]
    MessageRead {
        chat_id: i64,
        user_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
        marked: u64,
    },

    #[serde(rename = "stats.changed")]
    StatsChanged {
        unassigned_chats: i64,
        operator_loads: Vec<OperatorLoad>,
    },

    #[serde(rename = "user.online")]
    UserOnline { user_id: i64, role: UserRole },

    #[serde(rename = "user.offline")]
    UserOffline {
        user_id: i64,
        #[serde(with = "time::serde::rfc3339")]
        last_seen: OffsetDateTime,
    },

    /// Sent once right after a privileged connection is accepted
    #[serde(rename = "presence.snapshot")]
    PresenceSnapshot {
        unassigned_chats: i64,
        operator_loads: Vec<OperatorLoad>,
        online_users: Vec<i64>,
    },

    /// Event injected by another subsystem into a chat room
    #[serde(rename = "chat.event")]
    ChatEvent {
        chat_id: i64,
        event_type: String,
        payload: serde_json::Value,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn stats_changed(stats: ChatStats) -> Self {
        Self::StatsChanged {
            unassigned_chats: stats.unassigned_chats,
            operator_loads: stats.operator_loads,
        }
    }

    pub fn presence_snapshot(stats: ChatStats, online_users: Vec<i64>) -> Self {
        Self::PresenceSnapshot {
            unassigned_chats: stats.unassigned_chats,
            operator_loads: stats.operator_loads,
            online_users,
        }
    }

    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatNew { .. } => "chat.new",
            Self::ChatAssigned { .. } => "chat.assigned",
            Self::ChatInactive { .. } => "chat.inactive",
            Self::ChatMessage { .. } => "chat.message",
            Self::MessageNew { .. } => "message.new",
            Self::MessageEdited { .. } => "message.edited",
            Self::MessageReaction { .. } => "message.reaction",
            Self::MessageRead { .. } => "message.read",
            Self::StatsChanged { .. } => "stats.changed",
            Self::UserOnline { .. } => "user.online",
            Self::UserOffline { .. } => "user.offline",
            Self::PresenceSnapshot { .. } => "presence.snapshot",
            Self::ChatEvent { .. } => "chat.event",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Whether a per-chat emission is mirrored to every privileged connection
    pub fn global_mirror(&self) -> bool {
        matches!(
            self,
            Self::ChatAssigned { .. } | Self::ChatInactive { .. } | Self::MessageReaction { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_frame_deserialization() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[test]
    fn test_server_event_serialization() {
        let json = serde_json::to_string(&ServerEvent::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let event = ServerEvent::ChatInactive {
            chat_id: 4,
            client_id: 9,
            previous_operator_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "chat.inactive");
        assert_eq!(value["chat_id"], 4);
    }

    #[test]
    fn test_wire_name_matches_tag() {
        let events = vec![
            ServerEvent::UserOnline {
                user_id: 1,
                role: UserRole::Operator,
            },
            ServerEvent::MessageRead {
                chat_id: 1,
                user_id: 2,
                message_id: None,
                marked: 3,
            },
            ServerEvent::ChatEvent {
                chat_id: 1,
                event_type: "order.updated".into(),
                payload: json!({"order_id": 12}),
            },
            ServerEvent::stats_changed(ChatStats::default()),
            ServerEvent::presence_snapshot(ChatStats::default(), vec![3]),
            ServerEvent::Error {
                message: "nope".into(),
            },
        ];

        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
        }
    }

    #[test]
    fn test_relay_round_trip_keeps_variant() {
        let event = ServerEvent::MessageReaction {
            chat_id: 1,
            message_id: 2,
            user_id: 3,
            action: ReactionAction::Changed,
            reactions: vec![ReactionGroup {
                emoji: "👍".into(),
                count: 1,
                user_ids: vec![3],
            }],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_global_mirror_rules() {
        assert!(ServerEvent::ChatInactive {
            chat_id: 1,
            client_id: 2,
            previous_operator_id: Some(3),
        }
        .global_mirror());
        assert!(!ServerEvent::MessageRead {
            chat_id: 1,
            user_id: 2,
            message_id: Some(5),
            marked: 1,
        }
        .global_mirror());
        assert!(!ServerEvent::Pong.global_mirror());
    }
}
