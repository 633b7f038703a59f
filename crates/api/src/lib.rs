//! Livechat API Library
//!
//! This crate contains the live support chat server: chat lifecycle, message
//! store, presence tracking and real-time event delivery.

pub mod auth;
pub mod chats;
pub mod config;
pub mod error;
pub mod messages;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
