//! WebSocket connection handle
//!
//! One authenticated socket. Outbound events go through an unbounded channel
//! drained by the socket's send task, which also watches the close signal.

use std::sync::Arc;

use livechat_shared::UserRole;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::events::ServerEvent;

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Authenticated user ID
    pub user_id: i64,

    /// Role resolved at connect time
    pub role: UserRole,

    /// Channel to send events to this connection
    sender: mpsc::UnboundedSender<ServerEvent>,

    /// Asks the send task to close the socket
    shutdown: Arc<Notify>,
}

impl Connection {
    pub fn new(user_id: i64, role: UserRole, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            role,
            sender,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Send an event to this connection
    ///
    /// Returns Err if the socket's send task has gone away
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ask the socket to close; the request is kept until the send task sees it
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }
}
