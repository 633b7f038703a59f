//! Chat lifecycle routes
//!
//! Creation, assignment, closing and the three dashboard listings, plus the
//! per-chat message endpoints (history, posting, search, read state) and
//! cross-subsystem event injection.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use livechat_shared::{
    ActivityCursor, ChatOrigin, ChatSummary, MessageCursor, MessageView, NewMessage, Page,
    PageLimit, SweptChat, UserRole,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::Identity,
    error::{ApiError, ApiResult},
    messages::HistoryQuery,
    state::AppState,
};

/// Upper bound on message text accepted over HTTP
pub(crate) const MAX_TEXT_LENGTH: usize = 10_000;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateChatRequest {
    /// Staff may open a chat on behalf of a client
    pub client_id: Option<i64>,
    pub operator_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateChatResponse {
    pub chat: ChatSummary,
    pub origin: ChatOrigin,
}

#[derive(Debug, Deserialize)]
pub struct ListChatsQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    /// Supervisors may look at another operator's queue
    pub operator_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssignRequest {
    pub operator_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub assigned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatSummary>,
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub closed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    /// full | since | before | offset
    pub mode: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    #[serde(default)]
    pub text: String,
    pub attachments: Option<serde_json::Value>,
    pub reply_to_message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MarkedResponse {
    pub marked: u64,
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub unread: i64,
}

#[derive(Debug, Deserialize)]
pub struct InjectEventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// =============================================================================
// Helpers
// =============================================================================

/// Load a chat the caller may see; clients only see their own
pub(crate) async fn accessible_chat(
    state: &AppState,
    identity: &Identity,
    chat_id: i64,
) -> ApiResult<ChatSummary> {
    let chat = state.chats.get(chat_id).await?.ok_or(ApiError::NotFound)?;
    if identity.is_privileged() || chat.client_id == identity.user_id {
        Ok(chat)
    } else {
        tracing::debug!(chat_id, user_id = identity.user_id, "Chat hidden from caller");
        Err(ApiError::NotFound)
    }
}

/// Whether the caller may post into, forward into or close a chat
///
/// Operators write only to chats assigned to them; supervisors to any.
pub(crate) fn may_write(identity: &Identity, chat: &ChatSummary) -> bool {
    match identity.role {
        UserRole::Client => chat.client_id == identity.user_id,
        UserRole::Operator => chat.operator_id == Some(identity.user_id),
        UserRole::Supervisor => true,
    }
}

/// Load a chat the caller may write to
pub(crate) async fn writable_chat(
    state: &AppState,
    identity: &Identity,
    chat_id: i64,
) -> ApiResult<ChatSummary> {
    let chat = accessible_chat(state, identity, chat_id).await?;
    if may_write(identity, &chat) {
        Ok(chat)
    } else {
        tracing::debug!(
            chat_id,
            user_id = identity.user_id,
            operator_id = chat.operator_id,
            "Write rejected: chat owned by another operator"
        );
        Err(ApiError::Forbidden)
    }
}

/// Translate history query parameters into a retrieval mode
pub(crate) fn parse_history(params: &HistoryParams) -> ApiResult<HistoryQuery> {
    let cursor = params
        .cursor
        .as_deref()
        .map(str::parse::<MessageCursor>)
        .transpose()?;
    let limit = PageLimit::new(params.limit);

    match params.mode.as_deref().unwrap_or("full") {
        "full" => Ok(HistoryQuery::Full),
        "since" => cursor
            .map(HistoryQuery::Since)
            .ok_or_else(|| ApiError::Validation("cursor is required for mode=since".into())),
        "before" => Ok(HistoryQuery::Before { cursor, limit }),
        "offset" => Ok(HistoryQuery::Offset {
            offset: params.offset.unwrap_or(0).max(0),
            limit,
        }),
        other => Err(ApiError::Validation(format!("unknown history mode '{}'", other))),
    }
}

fn parse_activity_cursor(raw: Option<&str>) -> ApiResult<Option<ActivityCursor>> {
    Ok(raw.map(str::parse::<ActivityCursor>).transpose()?)
}

/// Resolve who a chat is assigned to from the caller and the request
fn assignee(identity: &Identity, requested: Option<i64>) -> ApiResult<i64> {
    match (identity.role, requested) {
        (UserRole::Operator, None) => Ok(identity.user_id),
        (UserRole::Operator, Some(id)) if id == identity.user_id => Ok(id),
        (UserRole::Operator, Some(_)) => Err(ApiError::Forbidden),
        (UserRole::Supervisor, requested) => Ok(requested.unwrap_or(identity.user_id)),
        (UserRole::Client, _) => Err(ApiError::Forbidden),
    }
}

pub(crate) fn validate_text(text: &str, has_attachments: bool) -> ApiResult<()> {
    if text.trim().is_empty() && !has_attachments {
        return Err(ApiError::Validation("Message text cannot be empty".into()));
    }
    if text.len() > MAX_TEXT_LENGTH {
        return Err(ApiError::Validation(format!(
            "Message too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }
    Ok(())
}

// =============================================================================
// Lifecycle
// =============================================================================

/// POST /chats
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    body: Option<Json<CreateChatRequest>>,
) -> ApiResult<Json<CreateChatResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let (client_id, operator_id) = if identity.is_privileged() {
        let client_id = req
            .client_id
            .ok_or_else(|| ApiError::Validation("client_id is required".into()))?;
        (client_id, req.operator_id)
    } else {
        if req.client_id.is_some_and(|id| id != identity.user_id) || req.operator_id.is_some() {
            return Err(ApiError::Forbidden);
        }
        (identity.user_id, None)
    };

    let (chat, origin) = state.chats.create_or_reactivate(client_id, operator_id).await?;

    if origin.is_new_activity() {
        state.broadcaster.chat_created(&chat).await;
        state.publish_stats().await;
    }

    Ok(Json(CreateChatResponse { chat, origin }))
}

/// GET /chats/inbox
pub async fn list_inbox(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListChatsQuery>,
) -> ApiResult<Json<Page<ChatSummary>>> {
    identity.require_privileged()?;
    let cursor = parse_activity_cursor(query.cursor.as_deref())?;

    let page = state
        .chats
        .list_inbox(PageLimit::new(query.limit), cursor)
        .await?;
    Ok(Json(page))
}

/// GET /chats/queue
pub async fn list_queue(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListChatsQuery>,
) -> ApiResult<Json<Page<ChatSummary>>> {
    let operator_id = match (identity.role, query.operator_id) {
        (UserRole::Operator, None) => identity.user_id,
        (UserRole::Operator, Some(id)) if id == identity.user_id => id,
        (UserRole::Supervisor, requested) => requested.unwrap_or(identity.user_id),
        _ => return Err(ApiError::Forbidden),
    };
    let cursor = parse_activity_cursor(query.cursor.as_deref())?;

    let page = state
        .chats
        .list_operator_queue(operator_id, PageLimit::new(query.limit), cursor)
        .await?;
    Ok(Json(page))
}

/// GET /chats/active
pub async fn list_active(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListChatsQuery>,
) -> ApiResult<Json<Page<ChatSummary>>> {
    identity.require_role(UserRole::Supervisor)?;
    let cursor = parse_activity_cursor(query.cursor.as_deref())?;

    let page = state
        .chats
        .list_supervisor_active(PageLimit::new(query.limit), cursor)
        .await?;
    Ok(Json(page))
}

/// GET /chats/:id
pub async fn get_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
) -> ApiResult<Json<ChatSummary>> {
    Ok(Json(accessible_chat(&state, &identity, chat_id).await?))
}

/// POST /chats/:id/assign
pub async fn assign_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
    body: Option<Json<AssignRequest>>,
) -> ApiResult<Json<AssignResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let operator_id = assignee(&identity, req.operator_id)?;

    if operator_id != identity.user_id {
        let role: Option<UserRole> = sqlx::query_scalar("SELECT role FROM users WHERE id = $1")
            .bind(operator_id)
            .fetch_optional(&state.pool)
            .await?;
        if !role.is_some_and(|r| r.is_privileged()) {
            return Err(ApiError::Validation(format!(
                "user {} cannot take chats",
                operator_id
            )));
        }
    }

    if !state.chats.assign(chat_id, operator_id).await? {
        return Ok(Json(AssignResponse {
            assigned: false,
            chat: None,
        }));
    }

    let chat = state.chats.get(chat_id).await?.ok_or(ApiError::NotFound)?;
    state.broadcaster.chat_assigned(&chat, operator_id).await;
    state.publish_stats().await;

    Ok(Json(AssignResponse {
        assigned: true,
        chat: Some(chat),
    }))
}

/// POST /chats/:id/close
pub async fn close_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
) -> ApiResult<Json<CloseResponse>> {
    let chat = writable_chat(&state, &identity, chat_id).await?;

    let closed = state.chats.close(chat_id).await?;
    if closed {
        state
            .broadcaster
            .chat_inactive(&SweptChat {
                id: chat.id,
                client_id: chat.client_id,
                previous_operator_id: chat.operator_id,
            })
            .await;
        state.publish_stats().await;
    }

    Ok(Json(CloseResponse { closed }))
}

// =============================================================================
// Chat messages
// =============================================================================

/// GET /chats/:id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<MessageView>>> {
    let query = parse_history(&params)?;
    accessible_chat(&state, &identity, chat_id).await?;

    Ok(Json(state.messages.list(chat_id, query).await?))
}

/// POST /chats/:id/messages
pub async fn post_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<MessageView>)> {
    validate_text(&req.text, req.attachments.is_some())?;

    let chat = writable_chat(&state, &identity, chat_id).await?;
    if !chat.is_active() {
        return Err(ApiError::Conflict("Chat is inactive".into()));
    }

    let message = NewMessage::from_role(chat_id, identity.user_id, identity.role, req.text)
        .with_attachments(req.attachments)
        .replying_to(req.reply_to_message_id);
    let message_id = state.messages.append(&message).await?;

    let view = state
        .messages
        .get(message_id)
        .await?
        .ok_or(ApiError::Internal)?;
    state.broadcaster.message_created(&view).await;

    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /chats/:id/messages/search
pub async fn search_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<MessageView>>> {
    accessible_chat(&state, &identity, chat_id).await?;

    let hits = state
        .messages
        .search(chat_id, &query.q, PageLimit::new(query.limit))
        .await?;
    Ok(Json(hits))
}

/// POST /chats/:id/read
pub async fn mark_chat_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
) -> ApiResult<Json<MarkedResponse>> {
    accessible_chat(&state, &identity, chat_id).await?;

    let marked = state.messages.mark_chat_read(chat_id, identity.user_id).await?;
    if marked > 0 {
        state
            .broadcaster
            .messages_read(chat_id, identity.user_id, None, marked)
            .await;
    }

    Ok(Json(MarkedResponse { marked }))
}

/// GET /chats/:id/unread
pub async fn unread_count(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
) -> ApiResult<Json<UnreadResponse>> {
    accessible_chat(&state, &identity, chat_id).await?;

    let unread = state.messages.unread_count(chat_id, identity.user_id).await?;
    Ok(Json(UnreadResponse { unread }))
}

/// POST /chats/:id/events
pub async fn inject_event(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(chat_id): Path<i64>,
    Json(req): Json<InjectEventRequest>,
) -> ApiResult<StatusCode> {
    identity.require_privileged()?;
    if req.event_type.trim().is_empty() {
        return Err(ApiError::Validation("event_type cannot be empty".into()));
    }
    state.chats.get(chat_id).await?.ok_or(ApiError::NotFound)?;

    state
        .broadcaster
        .inject(chat_id, req.event_type.trim(), req.payload)
        .await;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: i64, role: UserRole) -> Identity {
        Identity {
            user_id,
            role,
            display_name: None,
        }
    }

    #[test]
    fn test_history_modes() {
        let params = HistoryParams::default();
        assert_eq!(parse_history(&params).ok(), Some(HistoryQuery::Full));

        let params = HistoryParams {
            mode: Some("offset".into()),
            offset: Some(-5),
            limit: Some(500),
            ..Default::default()
        };
        assert_eq!(
            parse_history(&params).ok(),
            Some(HistoryQuery::Offset {
                offset: 0,
                limit: PageLimit::new(Some(100)),
            })
        );

        let params = HistoryParams {
            mode: Some("before".into()),
            ..Default::default()
        };
        assert!(matches!(
            parse_history(&params),
            Ok(HistoryQuery::Before { cursor: None, .. })
        ));
    }

    #[test]
    fn test_history_rejects_bad_input() {
        let since_without_cursor = HistoryParams {
            mode: Some("since".into()),
            ..Default::default()
        };
        assert!(matches!(
            parse_history(&since_without_cursor),
            Err(ApiError::Validation(_))
        ));

        let bad_cursor = HistoryParams {
            mode: Some("before".into()),
            cursor: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(matches!(parse_history(&bad_cursor), Err(ApiError::Validation(_))));

        let unknown = HistoryParams {
            mode: Some("sideways".into()),
            ..Default::default()
        };
        assert!(parse_history(&unknown).is_err());
    }

    #[test]
    fn test_assignee_rules() {
        let op = identity(5, UserRole::Operator);
        assert_eq!(assignee(&op, None).ok(), Some(5));
        assert_eq!(assignee(&op, Some(5)).ok(), Some(5));
        assert!(matches!(assignee(&op, Some(6)), Err(ApiError::Forbidden)));

        let sup = identity(9, UserRole::Supervisor);
        assert_eq!(assignee(&sup, Some(5)).ok(), Some(5));
        assert_eq!(assignee(&sup, None).ok(), Some(9));

        assert!(assignee(&identity(1, UserRole::Client), None).is_err());
    }

    #[test]
    fn test_write_requires_ownership() {
        let at = time::macros::datetime!(2026-03-01 10:00:00 UTC);
        let mut chat = ChatSummary {
            id: 1,
            client_id: 42,
            client_name: None,
            operator_id: Some(5),
            operator_name: None,
            status: livechat_shared::ChatStatus::Active,
            created_at: at,
            updated_at: at,
            last_activity_at: at,
        };

        assert!(may_write(&identity(5, UserRole::Operator), &chat));
        assert!(!may_write(&identity(6, UserRole::Operator), &chat));
        assert!(may_write(&identity(9, UserRole::Supervisor), &chat));
        assert!(may_write(&identity(42, UserRole::Client), &chat));
        assert!(!may_write(&identity(43, UserRole::Client), &chat));

        // Nobody has claimed it yet
        chat.operator_id = None;
        assert!(!may_write(&identity(5, UserRole::Operator), &chat));
        assert!(may_write(&identity(9, UserRole::Supervisor), &chat));
    }

    #[test]
    fn test_text_validation() {
        assert!(validate_text("hello", false).is_ok());
        assert!(validate_text("   ", true).is_ok());
        assert!(validate_text("  ", false).is_err());
        assert!(validate_text(&"x".repeat(MAX_TEXT_LENGTH + 1), false).is_err());
    }
}
