//! Application configuration

use std::env;
use std::time::Duration;

/// Default silence after which the worker sweeps an active chat to inactive
pub const DEFAULT_INACTIVITY_SECS: u64 = 3600;
/// Default window during which an author may edit a message
pub const DEFAULT_EDIT_WINDOW_SECS: u64 = 900;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub log_format: LogFormat,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis (optional cross-instance event relay)
    pub redis_url: Option<String>,
    pub relay_channel: String,

    // Authentication
    pub jwt_secret: String,

    // Chat behaviour
    pub message_edit_window: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            log_format: parse_log_format(env::var("LOG_FORMAT").ok().as_deref())?,

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            // Redis
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            relay_channel: env::var("RELAY_CHANNEL")
                .unwrap_or_else(|_| "livechat:events".to_string()),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Chat behaviour
            message_edit_window: duration_secs(
                "MESSAGE_EDIT_WINDOW_SECS",
                DEFAULT_EDIT_WINDOW_SECS,
            )?,
        })
    }
}

fn parse_log_format(raw: Option<&str>) -> Result<LogFormat, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") | Some("pretty") => Ok(LogFormat::Pretty),
        Some("json") => Ok(LogFormat::Json),
        Some(_) => Err(ConfigError::Invalid("LOG_FORMAT must be 'pretty' or 'json'")),
    }
}

/// Read a positive number of seconds, falling back to `default` when unset
pub fn duration_secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match env::var(var) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::NotANumber(var))?,
        Err(_) => default,
    };

    if secs == 0 {
        return Err(ConfigError::NotANumber(var));
    }

    Ok(Duration::from_secs(secs))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("{0} must be a positive whole number of seconds")]
    NotANumber(&'static str),
}
