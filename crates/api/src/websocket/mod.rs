//! WebSocket support for real-time chat events
//!
//! # Architecture
//!
//! - **Connection**: an authenticated socket and its outbound channel
//! - **Presence**: live connection and online status per privileged user
//! - **Room**: chat-based pub/sub for sockets watching one chat
//! - **Broadcaster**: typed event catalog and audience routing
//! - **Relay**: optional Redis pub/sub fan-out across instances
//! - **Handler**: Axum WebSocket route handlers

pub mod broadcaster;
pub mod connection;
pub mod events;
pub mod handler;
pub mod presence;
pub mod relay;
pub mod room;

pub use broadcaster::{Audience, Envelope, EventBroadcaster};
pub use events::ServerEvent;
pub use handler::{chat_ws_handler, ws_handler};
pub use presence::PresenceTracker;
pub use relay::{RedisRelay, RelayError};
pub use room::RoomManager;
