//! Livechat Shared Types and Utilities
//!
//! This crate contains the domain types, errors, and database helpers shared
//! by the live chat API server and the background worker.

pub mod db;
pub mod error;
pub mod pagination;
pub mod types;

pub use db::*;
pub use error::*;
pub use pagination::{ActivityCursor, MessageCursor, PageLimit, Page};
pub use types::*;
