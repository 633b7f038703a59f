use std::collections::HashMap;
use std::time::Duration;

use livechat_shared::{
    ForwardedFrom, MessageCursor, MessageView, NewMessage, PageLimit, ReactionAction, ReactionGroup,
    ReactionOutcome, ReadMark, SenderType, UserRole,
};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

use super::provenance::chain_root;
use super::reactions::{decide, group_by_message, group_reactions};
use crate::error::{ApiError, ApiResult};

const MESSAGE_COLUMNS: &str = r#"
    m.id,
    m.chat_id,
    m.sender_id,
    m.sender_type,
    m.operator_id,
    m.text,
    m.attachments,
    m.reply_to_message_id,
    m.forwarded_from_message_id,
    m.forwarded_from_chat_id,
    m.forwarded_from_user_id,
    m.edited_at,
    m.created_at
"#;

/// Retrieval mode for a chat's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryQuery {
    /// Everything, oldest first
    Full,
    /// Only messages strictly newer than the cursor, oldest first
    Since(MessageCursor),
    /// The page just before the cursor (or the latest page), oldest first
    Before {
        cursor: Option<MessageCursor>,
        limit: PageLimit,
    },
    /// Offset from the newest message, oldest first within the page
    Offset { offset: i64, limit: PageLimit },
}

impl HistoryQuery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Since(_) => "since",
            Self::Before { .. } => "before",
            Self::Offset { .. } => "offset",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    sender_id: Option<i64>,
    sender_type: SenderType,
    operator_id: Option<i64>,
    text: String,
    attachments: Option<serde_json::Value>,
    reply_to_message_id: Option<i64>,
    forwarded_from_message_id: Option<i64>,
    forwarded_from_chat_id: Option<i64>,
    forwarded_from_user_id: Option<i64>,
    edited_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl MessageRow {
    fn forwarded_from(&self) -> Option<ForwardedFrom> {
        match (self.forwarded_from_message_id, self.forwarded_from_chat_id) {
            (Some(message_id), Some(chat_id)) => Some(ForwardedFrom {
                message_id,
                chat_id,
                user_id: self.forwarded_from_user_id,
            }),
            _ => None,
        }
    }

    fn into_view(
        self,
        reactions: &mut HashMap<i64, Vec<ReactionGroup>>,
        read_counts: &HashMap<i64, i64>,
    ) -> MessageView {
        let forwarded_from = self.forwarded_from();
        MessageView {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            sender_type: self.sender_type,
            operator_id: self.operator_id,
            text: self.text,
            attachments: self.attachments,
            reply_to_message_id: self.reply_to_message_id,
            forwarded_from,
            edited_at: self.edited_at,
            created_at: self.created_at,
            reactions: reactions.remove(&self.id).unwrap_or_default(),
            read_count: read_counts.get(&self.id).copied().unwrap_or(0),
        }
    }
}

/// Message persistence and aggregate enrichment
#[derive(Clone)]
pub struct MessageService {
    pool: PgPool,
    edit_window: Duration,
}

impl MessageService {
    pub fn new(pool: PgPool, edit_window: Duration) -> Self {
        Self { pool, edit_window }
    }

    pub fn edit_window(&self) -> Duration {
        self.edit_window
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append a message and bump the chat's activity timestamp
    ///
    /// A reply must point at a message in the same chat.
    pub async fn append(&self, message: &NewMessage) -> ApiResult<i64> {
        self.insert(message, None).await?.ok_or_else(|| {
            tracing::debug!(
                chat_id = message.chat_id(),
                reply_to_message_id = message.reply_to_message_id(),
                "Reply target outside chat"
            );
            ApiError::Validation("reply_to_message_id must reference a message in this chat".into())
        })
    }

    /// Insert with optional provenance; activity never moves backwards
    ///
    /// Returns `None` when the reply target is missing or in another chat.
    async fn insert(
        &self,
        message: &NewMessage,
        forwarded: Option<ForwardedFrom>,
    ) -> ApiResult<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            WITH inserted AS (
                INSERT INTO messages (
                    chat_id, sender_id, sender_type, operator_id, text, attachments,
                    reply_to_message_id, forwarded_from_message_id,
                    forwarded_from_chat_id, forwarded_from_user_id
                )
                SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
                WHERE $7::bigint IS NULL
                   OR EXISTS (
                       SELECT 1 FROM messages parent
                       WHERE parent.id = $7 AND parent.chat_id = $1
                   )
                RETURNING id, chat_id, created_at
            ),
            bumped AS (
                UPDATE chats c
                SET last_activity_at = GREATEST(c.last_activity_at, inserted.created_at),
                    updated_at = NOW()
                FROM inserted
                WHERE c.id = inserted.chat_id
            )
            SELECT id FROM inserted
            "#,
        )
        .bind(message.chat_id())
        .bind(message.sender_id())
        .bind(message.sender_type())
        .bind(message.operator_id())
        .bind(message.text())
        .bind(message.attachments().cloned())
        .bind(message.reply_to_message_id())
        .bind(forwarded.map(|f| f.message_id))
        .bind(forwarded.map(|f| f.chat_id))
        .bind(forwarded.and_then(|f| f.user_id))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = id {
            tracing::debug!(
                message_id = id,
                chat_id = message.chat_id(),
                sender_type = message.sender_type().as_str(),
                forwarded = forwarded.is_some(),
                "Message stored"
            );
        }

        Ok(id)
    }

    /// Edit a message's text if the acting user authored it and the window is open
    ///
    /// Returns `None` when any precondition fails.
    pub async fn edit(
        &self,
        message_id: i64,
        new_text: &str,
        acting_user_id: i64,
    ) -> ApiResult<Option<MessageView>> {
        self.edit_at(message_id, new_text, acting_user_id, OffsetDateTime::now_utc())
            .await
    }

    /// Edit evaluated against an explicit `now`
    pub async fn edit_at(
        &self,
        message_id: i64,
        new_text: &str,
        acting_user_id: i64,
        now: OffsetDateTime,
    ) -> ApiResult<Option<MessageView>> {
        let cutoff = now - self.edit_window;

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET text = $2, edited_at = $3
            WHERE id = $1
              AND sender_type <> 'system'
              AND (
                  (sender_type = 'operator' AND operator_id = $4)
                  OR (sender_type = 'client' AND sender_id = $4)
              )
              AND created_at >= $5
            "#,
        )
        .bind(message_id)
        .bind(new_text)
        .bind(now)
        .bind(acting_user_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(message_id, acting_user_id, "Edit rejected");
            return Ok(None);
        }

        tracing::info!(message_id, acting_user_id, "Message edited");
        self.get(message_id).await
    }

    /// Copy a message into another chat, recording the chain root as provenance
    pub async fn forward(
        &self,
        message_id: i64,
        target_chat_id: i64,
        sender_id: i64,
        sender_role: UserRole,
    ) -> ApiResult<Option<i64>> {
        let sql = format!("SELECT {} FROM messages m WHERE m.id = $1", MESSAGE_COLUMNS);
        let source = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(source) = source else {
            return Ok(None);
        };

        let root = chain_root(
            source.id,
            source.chat_id,
            source.sender_id,
            source.forwarded_from(),
        );
        let copy = NewMessage::from_role(target_chat_id, sender_id, sender_role, source.text)
            .with_attachments(source.attachments);

        let Some(id) = self.insert(&copy, Some(root)).await? else {
            return Ok(None);
        };
        tracing::info!(
            message_id = id,
            source_message_id = message_id,
            root_message_id = root.message_id,
            target_chat_id,
            "Message forwarded"
        );

        Ok(Some(id))
    }

    /// Toggle a user's reaction on a message
    ///
    /// Runs in one transaction with the message row locked so concurrent
    /// toggles on the same message serialize.
    pub async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: i64,
        emoji: &str,
    ) -> ApiResult<Option<ReactionOutcome>> {
        let mut tx = self.pool.begin().await?;

        let chat_id: Option<i64> =
            sqlx::query_scalar("SELECT chat_id FROM messages WHERE id = $1 FOR UPDATE")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(chat_id) = chat_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let current: Option<String> = sqlx::query_scalar(
            "SELECT emoji FROM message_reactions WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let action = decide(current.as_deref(), emoji);
        match action {
            ReactionAction::Added | ReactionAction::Changed => {
                sqlx::query(
                    r#"
                    INSERT INTO message_reactions (message_id, user_id, emoji)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (message_id, user_id)
                    DO UPDATE SET emoji = EXCLUDED.emoji, created_at = NOW()
                    "#,
                )
                .bind(message_id)
                .bind(user_id)
                .bind(emoji.trim())
                .execute(&mut *tx)
                .await?;
            }
            ReactionAction::Removed => {
                sqlx::query("DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2")
                    .bind(message_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
            }
            ReactionAction::Unchanged => {}
        }

        let pairs: Vec<(String, i64)> = sqlx::query_as(
            "SELECT emoji, user_id FROM message_reactions WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(message_id, user_id, action = action.as_str(), "Reaction toggled");

        Ok(Some(ReactionOutcome {
            message_id,
            chat_id,
            action,
            reactions: group_reactions(pairs),
        }))
    }

    /// Record a read receipt, keeping the first read time
    ///
    /// Storage errors are logged and reported as `None`.
    pub async fn mark_read(&self, message_id: i64, user_id: i64) -> Option<ReadMark> {
        let result: Result<Option<(i64, i64, OffsetDateTime)>, sqlx::Error> = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT id, chat_id FROM messages WHERE id = $1
            ),
            receipt AS (
                INSERT INTO message_reads (message_id, user_id)
                SELECT id, $2 FROM target
                ON CONFLICT (message_id, user_id)
                DO UPDATE SET read_at = message_reads.read_at
                RETURNING message_id, read_at
            )
            SELECT receipt.message_id, target.chat_id, receipt.read_at
            FROM receipt
            JOIN target ON target.id = receipt.message_id
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some((message_id, chat_id, read_at))) => Some(ReadMark {
                message_id,
                chat_id,
                user_id,
                read_at,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(message_id, user_id, error = %e, "Failed to record read receipt");
                None
            }
        }
    }

    /// Mark every unread message in a chat as read by `user_id`
    ///
    /// Skips the user's own and system messages; existing receipts are kept.
    pub async fn mark_chat_read(&self, chat_id: i64, user_id: i64) -> ApiResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_reads (message_id, user_id)
            SELECT m.id, $2
            FROM messages m
            WHERE m.chat_id = $1
              AND m.sender_type <> 'system'
              AND m.sender_id IS DISTINCT FROM $2
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.user_id = $2
              )
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let marked = result.rows_affected();
        if marked > 0 {
            tracing::debug!(chat_id, user_id, marked, "Chat marked read");
        }

        Ok(marked)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Messages in a chat not yet read by `user_id`, excluding own and system messages
    pub async fn unread_count(&self, chat_id: i64, user_id: i64) -> ApiResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m
            WHERE m.chat_id = $1
              AND m.sender_type <> 'system'
              AND m.sender_id IS DISTINCT FROM $2
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.user_id = $2
              )
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn get(&self, message_id: i64) -> ApiResult<Option<MessageView>> {
        let sql = format!("SELECT {} FROM messages m WHERE m.id = $1", MESSAGE_COLUMNS);
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.enrich(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Direct replies to a message within its own chat, oldest first
    pub async fn thread(&self, message_id: i64) -> ApiResult<Vec<MessageView>> {
        let sql = format!(
            r#"
            SELECT {} FROM messages m
            JOIN messages parent ON parent.id = m.reply_to_message_id
            WHERE m.reply_to_message_id = $1 AND m.chat_id = parent.chat_id
            ORDER BY m.created_at, m.id
            "#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;

        self.enrich(rows).await
    }

    /// Full-text search within one chat, most relevant first, ties by recency
    pub async fn search(
        &self,
        chat_id: i64,
        query: &str,
        limit: PageLimit,
    ) -> ApiResult<Vec<MessageView>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {}
            FROM messages m
            WHERE m.chat_id = $1
              AND m.search_vector @@ plainto_tsquery('simple', $2)
            ORDER BY ts_rank(m.search_vector, plainto_tsquery('simple', $2)) DESC,
                     m.created_at DESC,
                     m.id DESC
            LIMIT $3
            "#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(chat_id)
            .bind(query)
            .bind(limit.get())
            .fetch_all(&self.pool)
            .await?;

        tracing::debug!(chat_id, hits = rows.len(), "Message search");
        self.enrich(rows).await
    }

    /// Chat history in the requested mode; every mode returns oldest first
    pub async fn list(&self, chat_id: i64, query: HistoryQuery) -> ApiResult<Vec<MessageView>> {
        let rows = match query {
            HistoryQuery::Full => {
                let sql = format!(
                    "SELECT {} FROM messages m WHERE m.chat_id = $1 ORDER BY m.created_at, m.id",
                    MESSAGE_COLUMNS
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(chat_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            HistoryQuery::Since(cursor) => {
                let sql = format!(
                    r#"
                    SELECT {} FROM messages m
                    WHERE m.chat_id = $1 AND (m.created_at, m.id) > ($2, $3)
                    ORDER BY m.created_at, m.id
                    "#,
                    MESSAGE_COLUMNS
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(chat_id)
                    .bind(cursor.created_at)
                    .bind(cursor.id)
                    .fetch_all(&self.pool)
                    .await?
            }
            HistoryQuery::Before { cursor, limit } => {
                let sql = format!(
                    r#"
                    SELECT {} FROM messages m
                    WHERE m.chat_id = $1
                      AND ($2::timestamptz IS NULL OR (m.created_at, m.id) < ($2::timestamptz, $3::bigint))
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT $4
                    "#,
                    MESSAGE_COLUMNS
                );
                let mut rows = sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(chat_id)
                    .bind(cursor.map(|c| c.created_at))
                    .bind(cursor.map(|c| c.id))
                    .bind(limit.get())
                    .fetch_all(&self.pool)
                    .await?;
                rows.reverse();
                rows
            }
            HistoryQuery::Offset { offset, limit } => {
                let sql = format!(
                    r#"
                    SELECT {} FROM messages m
                    WHERE m.chat_id = $1
                    ORDER BY m.created_at DESC, m.id DESC
                    LIMIT $2 OFFSET $3
                    "#,
                    MESSAGE_COLUMNS
                );
                let mut rows = sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(chat_id)
                    .bind(limit.get())
                    .bind(offset.max(0))
                    .fetch_all(&self.pool)
                    .await?;
                rows.reverse();
                rows
            }
        };

        tracing::debug!(chat_id, mode = query.as_str(), returned = rows.len(), "Listed messages");
        self.enrich(rows).await
    }

    /// Attach reaction groups and read counts with one bulk query each
    async fn enrich(&self, rows: Vec<MessageRow>) -> ApiResult<Vec<MessageView>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();

        let reaction_rows: Vec<(i64, String, i64)> = sqlx::query_as(
            "SELECT message_id, emoji, user_id FROM message_reactions WHERE message_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let read_counts: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT message_id, COUNT(*)
            FROM message_reads
            WHERE message_id = ANY($1)
            GROUP BY message_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut reactions = group_by_message(reaction_rows);
        let read_counts: HashMap<i64, i64> = read_counts.into_iter().collect();

        Ok(rows
            .into_iter()
            .map(|row| row.into_view(&mut reactions, &read_counts))
            .collect())
    }
}
