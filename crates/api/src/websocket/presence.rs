//! Presence tracking for privileged users
//!
//! Holds the live connection per user and each user's online status. Both
//! maps live behind `RwLock`s and are only reachable through the tracker;
//! when both are needed, `connections` is locked before `statuses`.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;

/// Online status of a user as last observed by this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceStatus {
    pub online: bool,
    pub last_seen: OffsetDateTime,
}

/// Outcome of registering a connection
#[derive(Debug)]
pub enum Registration {
    /// Only operators and supervisors are tracked
    Rejected,
    Fresh,
    /// The user's previous connection was displaced
    Replaced(Arc<Connection>),
}

#[derive(Default)]
pub struct PresenceTracker {
    connections: RwLock<HashMap<i64, Arc<Connection>>>,
    statuses: RwLock<HashMap<i64, PresenceStatus>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` the user's live connection and mark the user online
    pub async fn register(&self, conn: Arc<Connection>) -> Registration {
        if !conn.role.is_privileged() {
            tracing::debug!(user_id = conn.user_id, role = conn.role.as_str(), "Presence registration rejected");
            return Registration::Rejected;
        }

        let mut connections = self.connections.write().await;
        let mut statuses = self.statuses.write().await;

        let previous = connections.insert(conn.user_id, Arc::clone(&conn));
        statuses.insert(
            conn.user_id,
            PresenceStatus {
                online: true,
                last_seen: OffsetDateTime::now_utc(),
            },
        );

        tracing::info!(
            user_id = conn.user_id,
            session_id = %conn.session_id,
            replaced = previous.is_some(),
            online_users = connections.len(),
            "Presence registered"
        );

        match previous {
            Some(old) => Registration::Replaced(old),
            None => Registration::Fresh,
        }
    }

    /// Refresh last-seen for the user's current session
    pub async fn touch(&self, user_id: i64, session_id: Uuid) -> bool {
        let connections = self.connections.read().await;
        if !connections
            .get(&user_id)
            .is_some_and(|c| c.session_id == session_id)
        {
            return false;
        }

        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&user_id) {
            status.last_seen = OffsetDateTime::now_utc();
        }
        true
    }

    /// Drop the user's connection and mark them offline
    ///
    /// Only the session that currently owns the entry may do this; a socket
    /// that was displaced by a newer one returns `None` and changes nothing.
    pub async fn unregister(&self, user_id: i64, session_id: Uuid) -> Option<OffsetDateTime> {
        let mut connections = self.connections.write().await;
        if !connections
            .get(&user_id)
            .is_some_and(|c| c.session_id == session_id)
        {
            return None;
        }
        connections.remove(&user_id);

        let now = OffsetDateTime::now_utc();
        let mut statuses = self.statuses.write().await;
        statuses.insert(
            user_id,
            PresenceStatus {
                online: false,
                last_seen: now,
            },
        );

        tracing::info!(user_id, session_id = %session_id, "Presence unregistered");
        Some(now)
    }

    /// Remove a stale connection entry without touching status
    pub async fn purge(&self, user_id: i64, session_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        if connections
            .get(&user_id)
            .is_some_and(|c| c.session_id == session_id)
        {
            connections.remove(&user_id);
            tracing::debug!(user_id, session_id = %session_id, "Purged stale connection");
            true
        } else {
            false
        }
    }

    pub async fn connection_for(&self, user_id: i64) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&user_id).cloned()
    }

    /// Copy of all live connections, for fan-out without holding the lock
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Online user ids, ascending, optionally leaving one out
    pub async fn online_users(&self, except: Option<i64>) -> Vec<i64> {
        let statuses = self.statuses.read().await;
        let mut users: Vec<i64> = statuses
            .iter()
            .filter(|(id, status)| status.online && Some(**id) != except)
            .map(|(id, _)| *id)
            .collect();
        users.sort_unstable();
        users
    }

    pub async fn status_of(&self, user_id: i64) -> Option<PresenceStatus> {
        self.statuses.read().await.get(&user_id).copied()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
