//! Common types used across Livechat

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::pagination::MessageCursor;

// =============================================================================
// Enumerations
// =============================================================================

/// Lifecycle state of a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "chat_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Active,
    Inactive,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sender_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Client,
    Operator,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }
}

/// Role of an identity as resolved from the users table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Client,
    Operator,
    Supervisor,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Operator => "operator",
            Self::Supervisor => "supervisor",
        }
    }

    /// Operators and supervisors may use the presence channel and dashboards
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Operator | Self::Supervisor)
    }

    /// Sender type used for messages written by this role
    pub fn sender_type(&self) -> SenderType {
        match self {
            Self::Client => SenderType::Client,
            Self::Operator | Self::Supervisor => SenderType::Operator,
        }
    }
}

// =============================================================================
// Chats
// =============================================================================

/// A chat merged with denormalized client/operator display names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChatSummary {
    pub id: i64,
    pub client_id: i64,
    pub client_name: Option<String>,
    pub operator_id: Option<i64>,
    pub operator_name: Option<String>,
    pub status: ChatStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl ChatSummary {
    pub fn is_active(&self) -> bool {
        self.status == ChatStatus::Active
    }

    pub fn is_assigned(&self) -> bool {
        self.operator_id.is_some()
    }
}

/// How `create_or_reactivate` produced its chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatOrigin {
    Created,
    Reactivated,
    Existing,
}

impl ChatOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reactivated => "reactivated",
            Self::Existing => "existing",
        }
    }

    /// Whether the chat just entered the active set
    pub fn is_new_activity(&self) -> bool {
        !matches!(self, Self::Existing)
    }
}

/// A chat transitioned to inactive by the inactivity sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SweptChat {
    pub id: i64,
    pub client_id: i64,
    pub previous_operator_id: Option<i64>,
}

/// Number of active chats held by one operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OperatorLoad {
    pub operator_id: i64,
    pub active_chats: i64,
}

/// Dashboard counters shown to privileged users
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub unassigned_chats: i64,
    pub operator_loads: Vec<OperatorLoad>,
}

// =============================================================================
// Messages
// =============================================================================

/// Root of a forwarding chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedFrom {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: Option<i64>,
}

/// Reactions of one emoji on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: i64,
    pub user_ids: Vec<i64>,
}

/// A message enriched with reaction and read aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub sender_type: SenderType,
    pub operator_id: Option<i64>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    pub reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<ForwardedFrom>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub edited_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub reactions: Vec<ReactionGroup>,
    pub read_count: i64,
}

impl MessageView {
    /// Position of this message in `(created_at, id)` order
    pub fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Input for appending a message
///
/// Built only through the constructors so that an operator message always
/// carries `operator_id == sender_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    chat_id: i64,
    sender_id: Option<i64>,
    sender_type: SenderType,
    text: String,
    attachments: Option<serde_json::Value>,
    reply_to_message_id: Option<i64>,
}

impl NewMessage {
    pub fn from_client(chat_id: i64, client_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            sender_id: Some(client_id),
            sender_type: SenderType::Client,
            text: text.into(),
            attachments: None,
            reply_to_message_id: None,
        }
    }

    pub fn from_operator(chat_id: i64, operator_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            sender_id: Some(operator_id),
            sender_type: SenderType::Operator,
            text: text.into(),
            attachments: None,
            reply_to_message_id: None,
        }
    }

    pub fn system(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            sender_id: None,
            sender_type: SenderType::System,
            text: text.into(),
            attachments: None,
            reply_to_message_id: None,
        }
    }

    /// Build a message authored by a user with the given role
    pub fn from_role(chat_id: i64, user_id: i64, role: UserRole, text: impl Into<String>) -> Self {
        match role.sender_type() {
            SenderType::Operator => Self::from_operator(chat_id, user_id, text),
            _ => Self::from_client(chat_id, user_id, text),
        }
    }

    pub fn with_attachments(mut self, attachments: Option<serde_json::Value>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn replying_to(mut self, message_id: Option<i64>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn sender_id(&self) -> Option<i64> {
        self.sender_id
    }

    pub fn sender_type(&self) -> SenderType {
        self.sender_type
    }

    /// Set iff the sender is an operator, and then equal to the sender id
    pub fn operator_id(&self) -> Option<i64> {
        match self.sender_type {
            SenderType::Operator => self.sender_id,
            _ => None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attachments(&self) -> Option<&serde_json::Value> {
        self.attachments.as_ref()
    }

    pub fn reply_to_message_id(&self) -> Option<i64> {
        self.reply_to_message_id
    }
}

// =============================================================================
// Reactions and read receipts
// =============================================================================

/// What a reaction toggle did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Changed,
    Removed,
    Unchanged,
}

impl ReactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of toggling a reaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionOutcome {
    pub message_id: i64,
    pub chat_id: i64,
    pub action: ReactionAction,
    pub reactions: Vec<ReactionGroup>,
}

/// A recorded read receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMark {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
}
