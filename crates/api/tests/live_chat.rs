//! Database integration tests for the chat lifecycle and message store
//!
//! These tests exercise the atomic statements against a real Postgres and
//! cover the concurrency guarantees that unit tests cannot.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/livechat_test"
//! cargo test -p livechat-api --test live_chat -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use livechat_api::{
    chats::ChatService,
    messages::{within_edit_window, HistoryQuery, MessageService},
    ApiError,
};
use livechat_shared::{
    create_pool, run_migrations, ChatOrigin, NewMessage, PageLimit, ReactionAction, UserRole,
};
use serial_test::serial;
use sqlx::PgPool;
use time::OffsetDateTime;

const EDIT_WINDOW: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup() -> (PgPool, ChatService, MessageService) {
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for integration tests");

    let pool = create_pool(&database_url, 16)
        .await
        .expect("Failed to connect to test database");
    run_migrations(&pool).await.expect("Failed to run migrations");

    (
        pool.clone(),
        ChatService::new(pool.clone()),
        MessageService::new(pool, EDIT_WINDOW),
    )
}

/// Ids unlikely to collide with other runs against the same database
fn unique_id() -> i64 {
    static NEXT: OnceLock<AtomicI64> = OnceLock::new();
    NEXT.get_or_init(|| {
        let seed = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64;
        AtomicI64::new(seed)
    })
    .fetch_add(1, Ordering::SeqCst)
}

async fn active_chats_for(pool: &PgPool, client_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE client_id = $1 AND status = 'active'")
        .bind(client_id)
        .fetch_one(pool)
        .await
        .expect("Failed to count chats")
}

/// Postgres keeps microseconds; drop the rest so stored values compare equal
fn to_micros(at: OffsetDateTime) -> OffsetDateTime {
    let nanos = at.nanosecond();
    at.replace_nanosecond(nanos - nanos % 1_000)
        .expect("truncated nanoseconds stay in range")
}

async fn set_last_activity(pool: &PgPool, chat_id: i64, at: OffsetDateTime) {
    sqlx::query("UPDATE chats SET last_activity_at = $2 WHERE id = $1")
        .bind(chat_id)
        .bind(to_micros(at))
        .execute(pool)
        .await
        .expect("Failed to set activity");
}

// ============================================================================
// Chat lifecycle
// ============================================================================

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_concurrent_create_yields_one_active_chat() {
    let (pool, chats, _) = setup().await;
    let client_id = unique_id();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let chats = chats.clone();
        handles.push(tokio::spawn(async move {
            chats.create_or_reactivate(client_id, None).await
        }));
    }

    let mut ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let (chat, origin) = handle.await.unwrap().unwrap();
        ids.insert(chat.id);
        if origin == ChatOrigin::Created {
            created += 1;
        }
        assert!(chat.is_active());
        assert_eq!(chat.operator_id, None);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);
    assert_eq!(active_chats_for(&pool, client_id).await, 1);
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_concurrent_assign_has_one_winner() {
    let (_pool, chats, _) = setup().await;
    let (chat, _) = chats.create_or_reactivate(unique_id(), None).await.unwrap();

    let operators: Vec<i64> = (0..6).map(|_| unique_id()).collect();
    let mut handles = Vec::new();
    for &operator_id in &operators {
        let chats = chats.clone();
        let chat_id = chat.id;
        handles.push(tokio::spawn(async move {
            (operator_id, chats.assign(chat_id, operator_id).await.unwrap())
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (operator_id, assigned) = handle.await.unwrap();
        if assigned {
            winners.push(operator_id);
        }
    }

    assert_eq!(winners.len(), 1);
    let refetched = chats.get(chat.id).await.unwrap().unwrap();
    assert_eq!(refetched.operator_id, Some(winners[0]));

    // Losers observe the chat as taken
    let loser = operators.iter().copied().find(|&id| id != winners[0]).unwrap();
    assert!(!chats.assign(chat.id, loser).await.unwrap());
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_sweep_then_reactivate() {
    let (pool, chats, _) = setup().await;
    let client_id = unique_id();
    let operator_id = unique_id();

    let (chat, _) = chats
        .create_or_reactivate(client_id, Some(operator_id))
        .await
        .unwrap();
    let now = OffsetDateTime::now_utc();
    set_last_activity(&pool, chat.id, now - Duration::from_secs(7200)).await;

    let swept = chats
        .sweep_inactive_before(now - Duration::from_secs(3600))
        .await
        .unwrap();
    let ours = swept.iter().find(|s| s.id == chat.id).expect("chat was not swept");
    assert_eq!(ours.client_id, client_id);
    assert_eq!(ours.previous_operator_id, Some(operator_id));

    // A second pass reports nothing new for this chat
    let again = chats
        .sweep_inactive_before(now - Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(again.iter().all(|s| s.id != chat.id));
    assert_eq!(active_chats_for(&pool, client_id).await, 0);

    let (revived, origin) = chats.create_or_reactivate(client_id, None).await.unwrap();
    assert_eq!(origin, ChatOrigin::Reactivated);
    assert_eq!(revived.id, chat.id);
    assert_eq!(revived.operator_id, None);

    let (same, origin) = chats.create_or_reactivate(client_id, None).await.unwrap();
    assert_eq!(origin, ChatOrigin::Existing);
    assert_eq!(same.id, chat.id);
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_reactivation_waiting_on_lock_keeps_new_owner() {
    let (pool, chats, _) = setup().await;
    let client_id = unique_id();
    let owner = unique_id();

    let (chat, _) = chats.create_or_reactivate(client_id, None).await.unwrap();
    assert!(chats.close(chat.id).await.unwrap());

    // Hold the row while a second caller tries to revive it
    let mut tx = pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM chats WHERE id = $1 FOR UPDATE")
        .bind(chat.id)
        .execute(&mut *tx)
        .await
        .unwrap();

    let waiting = {
        let chats = chats.clone();
        tokio::spawn(async move { chats.create_or_reactivate(client_id, None).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Meanwhile the chat is revived and claimed
    sqlx::query("UPDATE chats SET status = 'active', operator_id = $2 WHERE id = $1")
        .bind(chat.id)
        .bind(owner)
        .execute(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let (seen, origin) = waiting.await.unwrap().unwrap();
    assert_eq!(origin, ChatOrigin::Existing);
    assert_eq!(seen.id, chat.id);
    assert_eq!(seen.operator_id, Some(owner));

    let stored = chats.get(chat.id).await.unwrap().unwrap();
    assert_eq!(stored.operator_id, Some(owner));
    assert_eq!(active_chats_for(&pool, client_id).await, 1);
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_close_is_idempotent() {
    let (_pool, chats, _) = setup().await;
    let (chat, _) = chats.create_or_reactivate(unique_id(), None).await.unwrap();

    assert!(chats.close(chat.id).await.unwrap());
    assert!(!chats.close(chat.id).await.unwrap());
    assert!(!chats.assign(chat.id, unique_id()).await.unwrap());
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_keyset_pages_survive_activity_updates() {
    let (pool, chats, messages) = setup().await;
    let operator_id = unique_id();
    let base = OffsetDateTime::now_utc() - Duration::from_secs(600);

    let mut created = Vec::new();
    for i in 0..5u64 {
        let (chat, _) = chats
            .create_or_reactivate(unique_id(), Some(operator_id))
            .await
            .unwrap();
        set_last_activity(&pool, chat.id, base + Duration::from_secs(i * 10)).await;
        created.push(chat.id);
    }

    let limit = PageLimit::new(Some(2));
    let first = chats.list_operator_queue(operator_id, limit, None).await.unwrap();
    assert_eq!(first.total_count, 5);
    assert_eq!(first.items.len(), 2);
    let cursor = first.next_cursor.clone().expect("full page has a cursor");

    // A chat already seen moves to the top, and a new one appears
    let seen: HashSet<i64> = first.items.iter().map(|c| c.id).collect();
    let bumped = first.items[1].id;
    messages
        .append(&NewMessage::from_operator(bumped, operator_id, "still here"))
        .await
        .unwrap();
    chats
        .create_or_reactivate(unique_id(), Some(operator_id))
        .await
        .unwrap();

    let mut rest = Vec::new();
    let mut next = Some(cursor);
    while let Some(raw) = next {
        let page = chats
            .list_operator_queue(operator_id, limit, Some(raw.parse().unwrap()))
            .await
            .unwrap();
        rest.extend(page.items.iter().map(|c| c.id));
        next = page.next_cursor;
    }

    assert!(rest.iter().all(|id| !seen.contains(id)));
    let expected: HashSet<i64> = created.iter().copied().filter(|id| !seen.contains(id)).collect();
    assert_eq!(rest.iter().copied().collect::<HashSet<_>>(), expected);
}

// ============================================================================
// Message store
// ============================================================================

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_append_never_decreases_activity() {
    let (pool, chats, messages) = setup().await;
    let client_id = unique_id();
    let (chat, _) = chats.create_or_reactivate(client_id, None).await.unwrap();

    let id = messages
        .append(&NewMessage::from_client(chat.id, client_id, "hello"))
        .await
        .unwrap();
    let message = messages.get(id).await.unwrap().unwrap();
    let after = chats.get(chat.id).await.unwrap().unwrap();
    assert_eq!(after.last_activity_at, message.created_at);

    let future = to_micros(OffsetDateTime::now_utc() + Duration::from_secs(3600));
    set_last_activity(&pool, chat.id, future).await;
    messages
        .append(&NewMessage::from_client(chat.id, client_id, "again"))
        .await
        .unwrap();
    let after = chats.get(chat.id).await.unwrap().unwrap();
    assert_eq!(after.last_activity_at, future);
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_reaction_toggle_is_an_involution() {
    let (_pool, chats, messages) = setup().await;
    let client_id = unique_id();
    let (chat, _) = chats.create_or_reactivate(client_id, None).await.unwrap();
    let id = messages
        .append(&NewMessage::from_client(chat.id, client_id, "rate me"))
        .await
        .unwrap();
    let other = unique_id();

    let added = messages.toggle_reaction(id, client_id, "👍").await.unwrap().unwrap();
    assert_eq!(added.action, ReactionAction::Added);
    messages.toggle_reaction(id, other, "👍").await.unwrap();

    let changed = messages.toggle_reaction(id, client_id, "🎉").await.unwrap().unwrap();
    assert_eq!(changed.action, ReactionAction::Changed);
    assert_eq!(changed.reactions.iter().map(|g| g.count).sum::<i64>(), 2);

    let removed = messages.toggle_reaction(id, client_id, "🎉").await.unwrap().unwrap();
    assert_eq!(removed.action, ReactionAction::Removed);
    assert_eq!(removed.reactions.len(), 1);
    assert_eq!(removed.reactions[0].user_ids, vec![other]);

    let cleared = messages.toggle_reaction(id, other, "").await.unwrap().unwrap();
    assert!(cleared.reactions.is_empty());

    let view = messages.get(id).await.unwrap().unwrap();
    assert!(view.reactions.is_empty());

    assert!(messages.toggle_reaction(-1, other, "👍").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_edit_window_and_authorship() {
    let (_pool, chats, messages) = setup().await;
    let operator_id = unique_id();
    let (chat, _) = chats
        .create_or_reactivate(unique_id(), Some(operator_id))
        .await
        .unwrap();

    let id = messages
        .append(&NewMessage::from_operator(chat.id, operator_id, "draft"))
        .await
        .unwrap();
    let t0 = messages.get(id).await.unwrap().unwrap().created_at;

    let inside = t0 + Duration::from_secs(14 * 60 + 59);
    assert!(within_edit_window(t0, inside, EDIT_WINDOW));
    let edited = messages.edit_at(id, "final", operator_id, inside).await.unwrap();
    let edited = edited.expect("edit inside the window succeeds");
    assert_eq!(edited.text, "final");
    assert!(edited.edited_at.is_some());

    let outside = t0 + Duration::from_secs(15 * 60 + 1);
    assert!(messages.edit_at(id, "late", operator_id, outside).await.unwrap().is_none());

    // Someone else, inside the window
    assert!(messages.edit_at(id, "hijack", unique_id(), inside).await.unwrap().is_none());

    let system = messages
        .append(&NewMessage::system(chat.id, "Operator joined"))
        .await
        .unwrap();
    assert!(messages.edit(system, "nope", operator_id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_forward_chain_points_at_root() {
    let (_pool, chats, messages) = setup().await;
    let client_a = unique_id();
    let operator_id = unique_id();
    let (chat_a, _) = chats.create_or_reactivate(client_a, None).await.unwrap();
    let (chat_b, _) = chats.create_or_reactivate(unique_id(), Some(operator_id)).await.unwrap();
    let (chat_c, _) = chats.create_or_reactivate(unique_id(), Some(operator_id)).await.unwrap();

    let m1 = messages
        .append(
            &NewMessage::from_client(chat_a.id, client_a, "invoice attached")
                .with_attachments(Some(serde_json::json!([{"name": "invoice.pdf"}]))),
        )
        .await
        .unwrap();
    let m2 = messages
        .forward(m1, chat_b.id, operator_id, UserRole::Operator)
        .await
        .unwrap()
        .unwrap();
    let m3 = messages
        .forward(m2, chat_c.id, operator_id, UserRole::Operator)
        .await
        .unwrap()
        .unwrap();

    let view = messages.get(m3).await.unwrap().unwrap();
    let root = view.forwarded_from.expect("forward carries provenance");
    assert_eq!(root.message_id, m1);
    assert_eq!(root.chat_id, chat_a.id);
    assert_eq!(root.user_id, Some(client_a));
    assert_eq!(view.text, "invoice attached");
    assert!(view.attachments.is_some());
    assert_eq!(view.operator_id, Some(operator_id));

    assert!(messages
        .forward(-1, chat_c.id, operator_id, UserRole::Operator)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_read_receipts_and_unread_count() {
    let (_pool, chats, messages) = setup().await;
    let client_id = unique_id();
    let operator_id = unique_id();
    let (chat, _) = chats
        .create_or_reactivate(client_id, Some(operator_id))
        .await
        .unwrap();

    let first = messages
        .append(&NewMessage::from_client(chat.id, client_id, "one"))
        .await
        .unwrap();
    messages
        .append(&NewMessage::from_client(chat.id, client_id, "two"))
        .await
        .unwrap();
    messages
        .append(&NewMessage::from_operator(chat.id, operator_id, "mine"))
        .await
        .unwrap();
    messages
        .append(&NewMessage::system(chat.id, "Chat assigned"))
        .await
        .unwrap();

    assert_eq!(messages.unread_count(chat.id, operator_id).await.unwrap(), 2);

    let mark = messages.mark_read(first, operator_id).await.expect("receipt recorded");
    assert_eq!(mark.chat_id, chat.id);
    let again = messages.mark_read(first, operator_id).await.expect("receipt kept");
    assert_eq!(again.read_at, mark.read_at);
    assert!(messages.mark_read(-1, operator_id).await.is_none());

    assert_eq!(messages.mark_chat_read(chat.id, operator_id).await.unwrap(), 1);
    assert_eq!(messages.mark_chat_read(chat.id, operator_id).await.unwrap(), 0);
    assert_eq!(messages.unread_count(chat.id, operator_id).await.unwrap(), 0);

    let view = messages.get(first).await.unwrap().unwrap();
    assert_eq!(view.read_count, 1);
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_mark_chat_read_keeps_existing_receipts() {
    let (pool, chats, messages) = setup().await;
    let client_id = unique_id();
    let operator_id = unique_id();
    let (chat, _) = chats
        .create_or_reactivate(client_id, Some(operator_id))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for text in ["a", "b", "c"] {
        ids.push(
            messages
                .append(&NewMessage::from_client(chat.id, client_id, text))
                .await
                .unwrap(),
        );
    }

    let early = messages.mark_read(ids[0], operator_id).await.expect("receipt recorded");

    // Concurrent passes insert each remaining receipt exactly once
    let mut handles = Vec::new();
    for _ in 0..4 {
        let messages = messages.clone();
        let chat_id = chat.id;
        handles.push(tokio::spawn(async move {
            messages.mark_chat_read(chat_id, operator_id).await
        }));
    }
    let mut marked = 0;
    for handle in handles {
        marked += handle.await.unwrap().unwrap();
    }
    assert_eq!(marked, 2);
    assert_eq!(messages.mark_chat_read(chat.id, operator_id).await.unwrap(), 0);

    let read_at: OffsetDateTime = sqlx::query_scalar(
        "SELECT read_at FROM message_reads WHERE message_id = $1 AND user_id = $2",
    )
    .bind(ids[0])
    .bind(operator_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(read_at, early.read_at);

    for id in ids {
        assert_eq!(messages.get(id).await.unwrap().unwrap().read_count, 1);
    }
    assert_eq!(messages.unread_count(chat.id, operator_id).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_replies_stay_within_their_chat() {
    let (pool, chats, messages) = setup().await;
    let client_a = unique_id();
    let client_b = unique_id();
    let (chat_a, _) = chats.create_or_reactivate(client_a, None).await.unwrap();
    let (chat_b, _) = chats.create_or_reactivate(client_b, None).await.unwrap();

    let parent = messages
        .append(&NewMessage::from_client(chat_a.id, client_a, "my order number"))
        .await
        .unwrap();

    let foreign = messages
        .append(&NewMessage::from_client(chat_b.id, client_b, "peek").replying_to(Some(parent)))
        .await;
    assert!(matches!(foreign, Err(ApiError::Validation(_))));

    let missing = messages
        .append(&NewMessage::from_client(chat_a.id, client_a, "huh").replying_to(Some(-1)))
        .await;
    assert!(matches!(missing, Err(ApiError::Validation(_))));

    let history = messages.list(chat_b.id, HistoryQuery::Full).await.unwrap();
    assert!(history.is_empty());

    // A stray cross-chat row written outside the service stays out of the thread
    sqlx::query(
        r#"
        INSERT INTO messages (chat_id, sender_id, sender_type, text, reply_to_message_id)
        VALUES ($1, $2, 'client', 'stray', $3)
        "#,
    )
    .bind(chat_b.id)
    .bind(client_b)
    .bind(parent)
    .execute(&pool)
    .await
    .unwrap();

    let own = messages
        .append(&NewMessage::from_client(chat_a.id, client_a, "it is 42").replying_to(Some(parent)))
        .await
        .unwrap();

    let thread = messages.thread(parent).await.unwrap();
    assert_eq!(thread.iter().map(|m| m.id).collect::<Vec<_>>(), vec![own]);
    assert!(thread.iter().all(|m| m.chat_id == chat_a.id));
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
#[serial(sqlx_db)]
async fn test_history_modes_thread_and_search() {
    let (_pool, chats, messages) = setup().await;
    let client_id = unique_id();
    let (chat, _) = chats.create_or_reactivate(client_id, None).await.unwrap();

    let mut ids = Vec::new();
    for text in ["router is blinking", "which model", "the blinking one", "ok thanks"] {
        ids.push(
            messages
                .append(&NewMessage::from_client(chat.id, client_id, text))
                .await
                .unwrap(),
        );
    }
    let reply = messages
        .append(&NewMessage::from_client(chat.id, client_id, "model X").replying_to(Some(ids[1])))
        .await
        .unwrap();
    ids.push(reply);

    let full = messages.list(chat.id, HistoryQuery::Full).await.unwrap();
    assert_eq!(full.iter().map(|m| m.id).collect::<Vec<_>>(), ids);

    let since = messages
        .list(chat.id, HistoryQuery::Since(full[2].cursor()))
        .await
        .unwrap();
    assert_eq!(since.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

    let latest = messages
        .list(
            chat.id,
            HistoryQuery::Before {
                cursor: None,
                limit: PageLimit::new(Some(2)),
            },
        )
        .await
        .unwrap();
    assert_eq!(latest.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

    let older = messages
        .list(
            chat.id,
            HistoryQuery::Before {
                cursor: Some(latest[0].cursor()),
                limit: PageLimit::new(Some(2)),
            },
        )
        .await
        .unwrap();
    assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..3].to_vec());

    let offset = messages
        .list(
            chat.id,
            HistoryQuery::Offset {
                offset: 1,
                limit: PageLimit::new(Some(2)),
            },
        )
        .await
        .unwrap();
    assert_eq!(offset.iter().map(|m| m.id).collect::<Vec<_>>(), ids[2..4].to_vec());

    let thread = messages.thread(ids[1]).await.unwrap();
    assert_eq!(thread.iter().map(|m| m.id).collect::<Vec<_>>(), vec![reply]);

    let hits = messages
        .search(chat.id, "blinking", PageLimit::new(None))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|m| m.text.contains("blinking")));
    assert!(messages
        .search(chat.id, "   ", PageLimit::new(None))
        .await
        .unwrap()
        .is_empty());
}
