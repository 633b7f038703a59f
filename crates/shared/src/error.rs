//! Error types for Livechat

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiveChatError {
    #[error("Malformed cursor: {0}")]
    MalformedCursor(String),
}
