//! Worker configuration

use std::env;
use std::time::Duration;

use livechat_api::config::{duration_secs, ConfigError, DEFAULT_INACTIVITY_SECS};

/// Every minute, on the minute (seconds field first)
pub const DEFAULT_SWEEP_SCHEDULE: &str = "0 * * * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    pub relay_channel: String,
    pub sweep_schedule: String,
    pub chat_inactivity: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    ///
    /// Redis is required: sweep events reach sockets only through the relay.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            redis_url: env::var("REDIS_URL")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .ok_or(ConfigError::Missing("REDIS_URL"))?,
            relay_channel: env::var("RELAY_CHANNEL")
                .unwrap_or_else(|_| "livechat:events".to_string()),
            sweep_schedule: env::var("SWEEP_SCHEDULE")
                .unwrap_or_else(|_| DEFAULT_SWEEP_SCHEDULE.to_string()),
            chat_inactivity: duration_secs("CHAT_INACTIVITY_SECS", DEFAULT_INACTIVITY_SECS)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup() {
        for var in [
            "DATABASE_URL",
            "REDIS_URL",
            "RELAY_CHANNEL",
            "SWEEP_SCHEDULE",
            "CHAT_INACTIVITY_SECS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_redis_is_required() {
        cleanup();
        env::set_var("DATABASE_URL", "postgres://test");

        assert!(matches!(
            WorkerConfig::from_env(),
            Err(ConfigError::Missing("REDIS_URL"))
        ));

        cleanup();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("REDIS_URL", "redis://localhost:6379");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.sweep_schedule, DEFAULT_SWEEP_SCHEDULE);
        assert_eq!(config.chat_inactivity, Duration::from_secs(3600));
        assert_eq!(config.relay_channel, "livechat:events");

        cleanup();
    }

    #[test]
    #[serial]
    fn test_inactivity_override() {
        cleanup();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("REDIS_URL", "redis://localhost:6379");
        env::set_var("CHAT_INACTIVITY_SECS", "90");

        assert_eq!(
            WorkerConfig::from_env().unwrap().chat_inactivity,
            Duration::from_secs(90)
        );

        env::set_var("CHAT_INACTIVITY_SECS", "soon");
        assert!(WorkerConfig::from_env().is_err());

        cleanup();
    }
}
