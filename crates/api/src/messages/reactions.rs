//! Reaction toggle decisions and per-emoji grouping

use std::collections::HashMap;

use livechat_shared::{ReactionAction, ReactionGroup};

/// Decide what a toggle does given the user's current reaction
///
/// An empty (or blank) emoji clears, repeating the current emoji un-reacts,
/// anything else sets the emoji.
pub fn decide(current: Option<&str>, requested: &str) -> ReactionAction {
    let requested = requested.trim();
    match current {
        None if requested.is_empty() => ReactionAction::Unchanged,
        None => ReactionAction::Added,
        Some(_) if requested.is_empty() => ReactionAction::Removed,
        Some(existing) if existing == requested => ReactionAction::Removed,
        Some(_) => ReactionAction::Changed,
    }
}

/// Group `(emoji, user_id)` pairs of one message
///
/// Groups are ordered by count, most popular first, then by emoji; user ids
/// within a group are ascending.
pub fn group_reactions<I>(pairs: I) -> Vec<ReactionGroup>
where
    I: IntoIterator<Item = (String, i64)>,
{
    let mut by_emoji: HashMap<String, Vec<i64>> = HashMap::new();
    for (emoji, user_id) in pairs {
        by_emoji.entry(emoji).or_default().push(user_id);
    }

    let mut groups: Vec<ReactionGroup> = by_emoji
        .into_iter()
        .map(|(emoji, mut user_ids)| {
            user_ids.sort_unstable();
            user_ids.dedup();
            ReactionGroup {
                emoji,
                count: user_ids.len() as i64,
                user_ids,
            }
        })
        .collect();

    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
    groups
}

/// Group `(message_id, emoji, user_id)` rows from a bulk lookup
pub fn group_by_message<I>(rows: I) -> HashMap<i64, Vec<ReactionGroup>>
where
    I: IntoIterator<Item = (i64, String, i64)>,
{
    let mut per_message: HashMap<i64, Vec<(String, i64)>> = HashMap::new();
    for (message_id, emoji, user_id) in rows {
        per_message.entry(message_id).or_default().push((emoji, user_id));
    }

    per_message
        .into_iter()
        .map(|(message_id, pairs)| (message_id, group_reactions(pairs)))
        .collect()
}
