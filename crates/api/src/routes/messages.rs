//! Single-message routes: read, edit, forward, react, receipts and threads

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use livechat_shared::{MessageView, ReactionAction, ReactionOutcome, ReadMark};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::chats::{accessible_chat, validate_text, writable_chat};
use crate::{
    auth::Identity,
    error::{ApiError, ApiResult},
    messages::within_edit_window,
    state::AppState,
};

/// Longest emoji sequence accepted for a reaction
const MAX_EMOJI_LENGTH: usize = 32;

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    pub target_chat_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    /// Empty clears the caller's reaction
    #[serde(default)]
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ReadMark>,
}

/// Load a message whose chat the caller may see
async fn accessible_message(
    state: &AppState,
    identity: &Identity,
    message_id: i64,
) -> ApiResult<MessageView> {
    let message = state
        .messages
        .get(message_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    accessible_chat(state, identity, message.chat_id).await?;
    Ok(message)
}

/// GET /messages/:id
pub async fn get_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<i64>,
) -> ApiResult<Json<MessageView>> {
    Ok(Json(accessible_message(&state, &identity, message_id).await?))
}

/// PATCH /messages/:id
pub async fn edit_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<MessageView>> {
    validate_text(&req.text, false)?;
    let message = accessible_message(&state, &identity, message_id).await?;
    let now = OffsetDateTime::now_utc();
    if !within_edit_window(message.created_at, now, state.messages.edit_window()) {
        return Err(ApiError::Conflict("Message cannot be edited".into()));
    }

    let edited = state
        .messages
        .edit(message_id, &req.text, identity.user_id)
        .await?
        .ok_or_else(|| ApiError::Conflict("Message cannot be edited".into()))?;

    state.broadcaster.message_edited(&edited).await;
    Ok(Json(edited))
}

/// POST /messages/:id/forward
pub async fn forward_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<i64>,
    Json(req): Json<ForwardRequest>,
) -> ApiResult<(StatusCode, Json<MessageView>)> {
    accessible_message(&state, &identity, message_id).await?;
    let target = writable_chat(&state, &identity, req.target_chat_id).await?;
    if !target.is_active() {
        return Err(ApiError::Conflict("Chat is inactive".into()));
    }

    let forwarded_id = state
        .messages
        .forward(message_id, target.id, identity.user_id, identity.role)
        .await?
        .ok_or(ApiError::NotFound)?;

    let view = state
        .messages
        .get(forwarded_id)
        .await?
        .ok_or(ApiError::Internal)?;
    state.broadcaster.message_created(&view).await;

    Ok((StatusCode::CREATED, Json(view)))
}

/// POST /messages/:id/reactions
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> ApiResult<Json<ReactionOutcome>> {
    if req.emoji.len() > MAX_EMOJI_LENGTH {
        return Err(ApiError::Validation("Emoji too long".into()));
    }
    accessible_message(&state, &identity, message_id).await?;

    let outcome = state
        .messages
        .toggle_reaction(message_id, identity.user_id, &req.emoji)
        .await?
        .ok_or(ApiError::NotFound)?;

    if outcome.action != ReactionAction::Unchanged {
        state
            .broadcaster
            .reaction_changed(&outcome, identity.user_id)
            .await;
    }

    Ok(Json(outcome))
}

/// POST /messages/:id/read
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<i64>,
) -> ApiResult<Json<ReadResponse>> {
    accessible_message(&state, &identity, message_id).await?;

    let receipt = state.messages.mark_read(message_id, identity.user_id).await;
    if let Some(mark) = &receipt {
        state
            .broadcaster
            .messages_read(mark.chat_id, mark.user_id, Some(mark.message_id), 1)
            .await;
    }

    Ok(Json(ReadResponse {
        read: receipt.is_some(),
        receipt,
    }))
}

/// GET /messages/:id/thread
pub async fn thread(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<i64>,
) -> ApiResult<Json<Vec<MessageView>>> {
    accessible_message(&state, &identity, message_id).await?;
    Ok(Json(state.messages.thread(message_id).await?))
}
