//! Livechat API server

use std::sync::Arc;

use anyhow::Context;
use livechat_api::{
    config::{Config, LogFormat},
    routes::create_router,
    websocket::{EventBroadcaster, PresenceTracker, RedisRelay, RoomManager},
    AppState,
};
use livechat_shared::{create_migration_pool, create_pool, run_migrations};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,livechat_api=debug,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        relay = config.redis_url.is_some(),
        "Starting livechat API"
    );

    {
        let migration_pool = create_migration_pool(&config.database_url)
            .await
            .context("Failed to connect to database for migrations")?;
        run_migrations(&migration_pool)
            .await
            .context("Failed to run migrations")?;
        migration_pool.close().await;
    }

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    let mut broadcaster = EventBroadcaster::new(
        Arc::new(PresenceTracker::new()),
        Arc::new(RoomManager::new()),
    );

    // Without Redis every event stays on this instance
    let relay = match &config.redis_url {
        Some(url) => Some(
            RedisRelay::connect(url, config.relay_channel.clone())
                .await
                .context("Failed to connect event relay")?,
        ),
        None => None,
    };
    if let Some(relay) = &relay {
        broadcaster = broadcaster.with_relay(relay.clone());
        relay.spawn_subscriber(broadcaster.clone());
    }

    let bind_address = config.bind_address.clone();
    let state = AppState::with_broadcaster(pool, config, broadcaster);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
