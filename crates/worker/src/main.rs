//! Livechat background worker
//!
//! Runs the scheduled inactivity sweep.

mod config;
mod sweeper;

use std::sync::Arc;

use anyhow::Context;
use livechat_api::{
    chats::ChatService,
    websocket::{EventBroadcaster, PresenceTracker, RedisRelay, RoomManager},
};
use livechat_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,livechat_worker=debug")),
        )
        .init();

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        schedule = %config.sweep_schedule,
        inactivity_secs = config.chat_inactivity.as_secs(),
        "Starting livechat worker"
    );

    let pool = create_pool(&config.database_url, 2)
        .await
        .context("Failed to connect to database")?;
    let relay = RedisRelay::connect(&config.redis_url, config.relay_channel.clone())
        .await
        .context("Failed to connect event relay")?;

    // The worker holds no sockets; everything it emits goes out over the relay
    let broadcaster = EventBroadcaster::new(
        Arc::new(PresenceTracker::new()),
        Arc::new(RoomManager::new()),
    )
    .with_relay(relay);
    let chats = ChatService::new(pool);
    let threshold = config.chat_inactivity;

    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create scheduler")?;

    let sweep_job = Job::new_async(config.sweep_schedule.as_str(), move |_id, _scheduler| {
        let chats = chats.clone();
        let broadcaster = broadcaster.clone();
        Box::pin(async move {
            let closed = sweeper::sweep_inactive_chats(&chats, &broadcaster, threshold).await;
            if closed > 0 {
                tracing::info!(closed, "Inactivity sweep finished");
            }
        })
    })
    .context("Invalid SWEEP_SCHEDULE")?;

    scheduler
        .add(sweep_job)
        .await
        .context("Failed to register sweep job")?;
    scheduler.start().await.context("Failed to start scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    let mut scheduler = scheduler;
    scheduler
        .shutdown()
        .await
        .context("Failed to stop scheduler")?;

    Ok(())
}
