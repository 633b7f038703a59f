//! Message store: append, edit, forward, reactions, read receipts, search and history

mod provenance;
mod reactions;
mod service;

pub use provenance::{chain_root, within_edit_window};
pub use reactions::{decide, group_by_message, group_reactions};
pub use service::{HistoryQuery, MessageService};
