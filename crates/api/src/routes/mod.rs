//! API routes

pub mod chats;
pub mod health;
pub mod messages;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::require_auth,
    state::AppState,
    websocket::{chat_ws_handler, ws_handler},
};

/// Global request body limit
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let protected_api_routes = Router::new()
        // Chats
        .route("/chats", post(chats::create_chat))
        .route("/chats/inbox", get(chats::list_inbox))
        .route("/chats/queue", get(chats::list_queue))
        .route("/chats/active", get(chats::list_active))
        .route("/chats/:id", get(chats::get_chat))
        .route("/chats/:id/assign", post(chats::assign_chat))
        .route("/chats/:id/close", post(chats::close_chat))
        .route(
            "/chats/:id/messages",
            get(chats::list_messages).post(chats::post_message),
        )
        .route("/chats/:id/messages/search", get(chats::search_messages))
        .route("/chats/:id/read", post(chats::mark_chat_read))
        .route("/chats/:id/unread", get(chats::unread_count))
        .route("/chats/:id/events", post(chats::inject_event))
        // Messages
        .route(
            "/messages/:id",
            get(messages::get_message).patch(messages::edit_message),
        )
        .route("/messages/:id/forward", post(messages::forward_message))
        .route("/messages/:id/reactions", post(messages::toggle_reaction))
        .route("/messages/:id/read", post(messages::mark_read))
        .route("/messages/:id/thread", get(messages::thread))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    // WebSocket routes (auth handled in handler via query parameter)
    let websocket_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/chats/:chat_id", get(chat_ws_handler));

    let api_v1_routes = Router::new()
        .merge(protected_api_routes)
        .merge(websocket_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES)),
        )
        .with_state(state)
}
