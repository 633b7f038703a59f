//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    chats::ChatService,
    config::Config,
    messages::MessageService,
    websocket::{EventBroadcaster, PresenceTracker, RoomManager},
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    pub chats: ChatService,
    pub messages: MessageService,
    pub broadcaster: EventBroadcaster,
}

impl AppState {
    /// Build state with local-only event delivery
    pub fn new(pool: PgPool, config: Config) -> Self {
        let broadcaster = EventBroadcaster::new(
            Arc::new(PresenceTracker::new()),
            Arc::new(RoomManager::new()),
        );
        Self::with_broadcaster(pool, config, broadcaster)
    }

    pub fn with_broadcaster(pool: PgPool, config: Config, broadcaster: EventBroadcaster) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret),
            chats: ChatService::new(pool.clone()),
            messages: MessageService::new(pool.clone(), config.message_edit_window),
            broadcaster,
            config: Arc::new(config),
            pool,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState::new(self.jwt_manager.clone(), self.pool.clone())
    }

    /// Recompute dashboard counters and push them to privileged users
    pub async fn publish_stats(&self) {
        match self.chats.stats().await {
            Ok(stats) => self.broadcaster.stats_changed(stats).await,
            Err(e) => tracing::warn!(error = %e, "Failed to compute chat stats"),
        }
    }
}
