//! Forwarding provenance and edit window rules

use std::time::Duration;

use livechat_shared::ForwardedFrom;
use time::OffsetDateTime;

/// Provenance a forward of `source` should carry
///
/// A message that is itself a forward passes its recorded root through, so
/// re-forwarding never lengthens the chain.
pub fn chain_root(
    source_id: i64,
    source_chat_id: i64,
    source_sender_id: Option<i64>,
    source_provenance: Option<ForwardedFrom>,
) -> ForwardedFrom {
    source_provenance.unwrap_or(ForwardedFrom {
        message_id: source_id,
        chat_id: source_chat_id,
        user_id: source_sender_id,
    })
}

/// Whether a message created at `created_at` may still be edited at `now`
///
/// The boundary is inclusive.
pub fn within_edit_window(created_at: OffsetDateTime, now: OffsetDateTime, window: Duration) -> bool {
    now - created_at <= window
}
