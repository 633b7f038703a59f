//! Inactivity sweep
//!
//! Closes chats that have been silent past the threshold and tells every
//! instance about it through the relay.

use std::time::Duration;

use livechat_api::{chats::ChatService, websocket::EventBroadcaster};
use tracing::{error, info};

/// Run one sweep; returns how many chats were closed
///
/// Failures are logged and reported as zero so the schedule keeps running.
pub async fn sweep_inactive_chats(
    chats: &ChatService,
    broadcaster: &EventBroadcaster,
    threshold: Duration,
) -> usize {
    let swept = match chats.sweep_inactive(threshold).await {
        Ok(swept) => swept,
        Err(e) => {
            error!(error = %e, "Inactivity sweep failed");
            return 0;
        }
    };

    if swept.is_empty() {
        return 0;
    }

    for chat in &swept {
        info!(
            chat_id = chat.id,
            client_id = chat.client_id,
            previous_operator_id = ?chat.previous_operator_id,
            "Chat closed for inactivity"
        );
        broadcaster.chat_inactive(chat).await;
    }

    match chats.stats().await {
        Ok(stats) => broadcaster.stats_changed(stats).await,
        Err(e) => error!(error = %e, "Failed to compute stats after sweep"),
    }

    swept.len()
}
