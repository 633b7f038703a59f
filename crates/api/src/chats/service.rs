use std::time::Duration;

use livechat_shared::{
    ActivityCursor, ChatOrigin, ChatStats, ChatSummary, OperatorLoad, Page, PageLimit, SweptChat,
};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};

/// How many times `create_or_reactivate` retries after losing a race
pub const MAX_CREATE_ATTEMPTS: usize = 3;

const CHAT_COLUMNS: &str = r#"
    c.id,
    c.client_id,
    cu.display_name AS client_name,
    c.operator_id,
    ou.display_name AS operator_name,
    c.status,
    c.created_at,
    c.updated_at,
    c.last_activity_at
"#;

const CHAT_JOINS: &str = r#"
    FROM chats c
    LEFT JOIN users cu ON cu.id = c.client_id
    LEFT JOIN users ou ON ou.id = c.operator_id
"#;

/// Which active chats a listing covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatScope {
    /// Active chats waiting for an operator
    Inbox,
    /// Active chats owned by one operator
    OperatorQueue(i64),
    /// Active chats that have an operator, for supervisors
    SupervisorActive,
}

impl ChatScope {
    /// SQL predicate over alias `c`; the operator id, when needed, is bound at `param`
    fn predicate(&self, param: usize) -> String {
        match self {
            Self::Inbox => "c.status = 'active' AND c.operator_id IS NULL".to_string(),
            Self::OperatorQueue(_) => format!("c.status = 'active' AND c.operator_id = ${}", param),
            Self::SupervisorActive => "c.status = 'active' AND c.operator_id IS NOT NULL".to_string(),
        }
    }

    fn operator_id(&self) -> Option<i64> {
        match self {
            Self::OperatorQueue(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::OperatorQueue(_) => "operator_queue",
            Self::SupervisorActive => "supervisor_active",
        }
    }
}

fn parse_origin(raw: &str) -> Option<ChatOrigin> {
    match raw {
        "created" => Some(ChatOrigin::Created),
        "reactivated" => Some(ChatOrigin::Reactivated),
        "existing" => Some(ChatOrigin::Existing),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Chat lifecycle service backed by Postgres
#[derive(Clone)]
pub struct ChatService {
    pool: PgPool,
}

impl ChatService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return the client's active chat, reactivating or creating one if needed
    ///
    /// The check and the mutation run as one statement; the partial unique
    /// index on active chats turns a concurrent duplicate into a retry that
    /// observes the winner's chat. The revive only touches a row that is
    /// still inactive once its lock is acquired, so a caller that waited on
    /// a concurrent reactivation retries instead of clearing the new owner.
    pub async fn create_or_reactivate(
        &self,
        client_id: i64,
        operator_id: Option<i64>,
    ) -> ApiResult<(ChatSummary, ChatOrigin)> {
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let result: Result<Option<(i64, String)>, sqlx::Error> = sqlx::query_as(
                r#"
                WITH active AS (
                    SELECT id FROM chats WHERE client_id = $1 AND status = 'active'
                ),
                revived AS (
                    UPDATE chats
                    SET status = 'active',
                        operator_id = $2,
                        last_activity_at = NOW(),
                        updated_at = NOW()
                    WHERE id = (
                        SELECT id FROM chats
                        WHERE client_id = $1 AND status = 'inactive'
                        ORDER BY updated_at DESC, id DESC
                        LIMIT 1
                    )
                    AND status = 'inactive'
                    AND NOT EXISTS (SELECT 1 FROM active)
                    RETURNING id
                ),
                created AS (
                    INSERT INTO chats (client_id, operator_id)
                    SELECT $1, $2
                    WHERE NOT EXISTS (SELECT 1 FROM active)
                      AND NOT EXISTS (SELECT 1 FROM revived)
                    ON CONFLICT DO NOTHING
                    RETURNING id
                )
                SELECT id, 'existing'::text AS origin FROM active
                UNION ALL
                SELECT id, 'reactivated'::text AS origin FROM revived
                UNION ALL
                SELECT id, 'created'::text AS origin FROM created
                "#,
            )
            .bind(client_id)
            .bind(operator_id)
            .fetch_optional(&self.pool)
            .await;

            let (chat_id, origin) = match result {
                Ok(Some((id, origin))) => (id, origin),
                Ok(None) => {
                    tracing::debug!(client_id, attempt, "Lost chat creation race, retrying");
                    continue;
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(client_id, attempt, "Concurrent reactivation, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let origin = parse_origin(&origin).ok_or(ApiError::Internal)?;
            let chat = self.get(chat_id).await?.ok_or(ApiError::NotFound)?;

            if origin.is_new_activity() {
                tracing::info!(
                    chat_id,
                    client_id,
                    origin = origin.as_str(),
                    "Chat activated"
                );
            }

            return Ok((chat, origin));
        }

        tracing::warn!(client_id, "Could not settle active chat after retries");
        Err(ApiError::Conflict(
            "Chat is being created concurrently, please retry".to_string(),
        ))
    }

    /// Fetch a chat with display names
    pub async fn get(&self, chat_id: i64) -> ApiResult<Option<ChatSummary>> {
        let sql = format!("SELECT {} {} WHERE c.id = $1", CHAT_COLUMNS, CHAT_JOINS);
        let chat = sqlx::query_as::<_, ChatSummary>(&sql)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(chat)
    }

    /// Claim an active, unassigned chat for an operator
    ///
    /// Single compare-and-set: under concurrent callers exactly one succeeds.
    pub async fn assign(&self, chat_id: i64, operator_id: i64) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chats
            SET operator_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND operator_id IS NULL
            "#,
        )
        .bind(chat_id)
        .bind(operator_id)
        .execute(&self.pool)
        .await?;

        let assigned = result.rows_affected() == 1;
        if assigned {
            tracing::info!(chat_id, operator_id, "Chat assigned");
        } else {
            tracing::debug!(chat_id, operator_id, "Chat assignment skipped: already assigned or inactive");
        }

        Ok(assigned)
    }

    /// Close an active chat; a no-op when it is already inactive
    pub async fn close(&self, chat_id: i64) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chats
            SET status = 'inactive', operator_id = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(chat_id)
        .execute(&self.pool)
        .await?;

        let closed = result.rows_affected() == 1;
        if closed {
            tracing::info!(chat_id, "Chat closed");
        }

        Ok(closed)
    }

    /// Close every active chat silent for longer than `threshold`
    pub async fn sweep_inactive(&self, threshold: Duration) -> ApiResult<Vec<SweptChat>> {
        self.sweep_inactive_before(OffsetDateTime::now_utc() - threshold)
            .await
    }

    /// Close every active chat whose last activity is older than `cutoff`
    ///
    /// The affected set is returned by the same statement that transitions
    /// it, so each swept chat is reported exactly once.
    pub async fn sweep_inactive_before(&self, cutoff: OffsetDateTime) -> ApiResult<Vec<SweptChat>> {
        let swept: Vec<SweptChat> = sqlx::query_as(
            r#"
            WITH stale AS (
                SELECT id, operator_id
                FROM chats
                WHERE status = 'active' AND last_activity_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE chats c
            SET status = 'inactive', operator_id = NULL, updated_at = NOW()
            FROM stale
            WHERE c.id = stale.id
            RETURNING c.id, c.client_id, stale.operator_id AS previous_operator_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        if !swept.is_empty() {
            tracing::info!(count = swept.len(), cutoff = %cutoff, "Swept inactive chats");
        }

        Ok(swept)
    }

    /// Keyset-paginated listing ordered by (last_activity_at DESC, id DESC)
    pub async fn list(
        &self,
        scope: ChatScope,
        limit: PageLimit,
        cursor: Option<ActivityCursor>,
    ) -> ApiResult<Page<ChatSummary>> {
        let sql = format!(
            r#"
            SELECT {columns}
            {joins}
            WHERE {predicate}
              AND ($2::timestamptz IS NULL OR (c.last_activity_at, c.id) < ($2::timestamptz, $3::bigint))
            ORDER BY c.last_activity_at DESC, c.id DESC
            LIMIT $1
            "#,
            columns = CHAT_COLUMNS,
            joins = CHAT_JOINS,
            predicate = scope.predicate(4),
        );

        let mut query = sqlx::query_as::<_, ChatSummary>(&sql)
            .bind(limit.get())
            .bind(cursor.map(|c| c.last_activity_at))
            .bind(cursor.map(|c| c.id));
        if let Some(operator_id) = scope.operator_id() {
            query = query.bind(operator_id);
        }
        let items = query.fetch_all(&self.pool).await?;

        let count_sql = format!("SELECT COUNT(*) FROM chats c WHERE {}", scope.predicate(1));
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(operator_id) = scope.operator_id() {
            count_query = count_query.bind(operator_id);
        }
        let total_count = count_query.fetch_one(&self.pool).await?;

        let next_cursor = if items.len() as i64 == limit.get() {
            items.last().map(|chat| {
                ActivityCursor {
                    last_activity_at: chat.last_activity_at,
                    id: chat.id,
                }
                .to_string()
            })
        } else {
            None
        };

        tracing::debug!(
            scope = scope.as_str(),
            returned = items.len(),
            total_count,
            "Listed chats"
        );

        Ok(Page {
            items,
            total_count,
            next_cursor,
        })
    }

    pub async fn list_inbox(
        &self,
        limit: PageLimit,
        cursor: Option<ActivityCursor>,
    ) -> ApiResult<Page<ChatSummary>> {
        self.list(ChatScope::Inbox, limit, cursor).await
    }

    pub async fn list_operator_queue(
        &self,
        operator_id: i64,
        limit: PageLimit,
        cursor: Option<ActivityCursor>,
    ) -> ApiResult<Page<ChatSummary>> {
        self.list(ChatScope::OperatorQueue(operator_id), limit, cursor)
            .await
    }

    pub async fn list_supervisor_active(
        &self,
        limit: PageLimit,
        cursor: Option<ActivityCursor>,
    ) -> ApiResult<Page<ChatSummary>> {
        self.list(ChatScope::SupervisorActive, limit, cursor).await
    }

    /// Unassigned chat count and per-operator active chat counts
    pub async fn stats(&self) -> ApiResult<ChatStats> {
        let unassigned_chats: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chats WHERE status = 'active' AND operator_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let operator_loads: Vec<OperatorLoad> = sqlx::query_as(
            r#"
            SELECT operator_id, COUNT(*) AS active_chats
            FROM chats
            WHERE status = 'active' AND operator_id IS NOT NULL
            GROUP BY operator_id
            ORDER BY operator_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ChatStats {
            unassigned_chats,
            operator_loads,
        })
    }
}
