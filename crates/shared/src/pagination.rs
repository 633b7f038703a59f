//! Keyset cursors and page sizing
//!
//! Cursors are opaque strings of the form `<unix_micros>:<id>`. Postgres
//! stores timestamps with microsecond precision, so a cursor built from a
//! fetched row compares exactly against the stored value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::LiveChatError;

/// Default page size for listings
pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Largest page size a caller may request
pub const MAX_PAGE_SIZE: i64 = 100;

/// Page size clamped to `1..=MAX_PAGE_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimit(i64);

impl PageLimit {
    pub fn new(requested: Option<i64>) -> Self {
        Self(requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Default for PageLimit {
    fn default() -> Self {
        Self::new(None)
    }
}

/// One page of a keyset-paginated listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

fn encode(at: OffsetDateTime, id: i64) -> String {
    let micros = at.unix_timestamp_nanos() / 1_000;
    format!("{}:{}", micros, id)
}

fn decode(raw: &str) -> Result<(OffsetDateTime, i64), LiveChatError> {
    let malformed = || LiveChatError::MalformedCursor(raw.to_string());

    let (micros, id) = raw.trim().split_once(':').ok_or_else(malformed)?;
    let micros: i128 = micros.parse().map_err(|_| malformed())?;
    let id: i64 = id.parse().map_err(|_| malformed())?;
    let nanos = micros.checked_mul(1_000).ok_or_else(malformed)?;
    let at = OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| malformed())?;

    Ok((at, id))
}

/// Position in an activity-ordered chat listing: (last_activity_at DESC, id DESC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityCursor {
    pub last_activity_at: OffsetDateTime,
    pub id: i64,
}

impl fmt::Display for ActivityCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self.last_activity_at, self.id))
    }
}

impl FromStr for ActivityCursor {
    type Err = LiveChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (last_activity_at, id) = decode(s)?;
        Ok(Self {
            last_activity_at,
            id,
        })
    }
}

/// Position in a chat's message history: (created_at, id)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    pub created_at: OffsetDateTime,
    pub id: i64,
}

impl fmt::Display for MessageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self.created_at, self.id))
    }
}

impl FromStr for MessageCursor {
    type Err = LiveChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (created_at, id) = decode(s)?;
        Ok(Self { created_at, id })
    }
}
