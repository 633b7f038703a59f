//! Chat lifecycle management
//!
//! Creation and reactivation, race-safe assignment, closing, the inactivity
//! sweep, and keyset-paginated listings of chats.

mod service;

pub use service::{ChatScope, ChatService, MAX_CREATE_ATTEMPTS};
