//! Tests for MessageStreamController

mod common;

use common::{ids, memory_store, text, ScriptedStore};
use rentsync_chat::{ChatError, FetchOutcome, MessageStreamController};
use rentsync_realtime::MessageCreated;
use rentsync_store::{DataStore, MessageKind, StoreError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

async fn scripted() -> Arc<ScriptedStore> {
    Arc::new(ScriptedStore::new(memory_store().await))
}

fn controller(store: &Arc<ScriptedStore>, viewer: &str) -> Arc<MessageStreamController> {
    Arc::new(MessageStreamController::new(
        store.clone(),
        viewer,
        Arc::new(Notify::new()),
    ))
}

#[tokio::test]
async fn test_switch_during_slow_fetch_never_shows_stale_history() {
    let store = scripted().await;
    let conv1 = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();
    let conv2 = store
        .create_conversation(&ids(&["carol", "bob"]), None)
        .await
        .unwrap();
    store.insert_message(text(&conv1, "alice", "from conv-1")).await.unwrap();
    store.insert_message(text(&conv2, "carol", "from conv-2")).await.unwrap();
    store.delay_history(&conv1, Duration::from_millis(200));
    store.delay_history(&conv2, Duration::from_millis(10));

    let bob = controller(&store, "bob");
    let slow = {
        let bob = bob.clone();
        let conv1 = conv1.clone();
        tokio::spawn(async move { bob.fetch_messages(&conv1).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.fetch_messages(&conv2).await.unwrap(), FetchOutcome::Loaded(1));
    assert_eq!(slow.await.unwrap().unwrap(), FetchOutcome::Stale);

    let state = bob.snapshot();
    assert_eq!(state.conversation_id.as_deref(), Some(conv2.as_str()));
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "from conv-2");
    assert!(!state.loading);

    let rows = store.inner.conversation_summaries(&[conv1]).await.unwrap();
    let bob_row = rows.iter().find(|r| r.participant_id == "bob").unwrap();
    assert_eq!(bob_row.unread_count, 1, "stale fetch must not mark read");
}

#[tokio::test]
async fn test_send_then_echo_yields_single_copy() {
    let store = scripted().await;
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();

    let alice = controller(&store, "alice");
    alice.fetch_messages(&conv).await.unwrap();

    let sent = alice.send(&conv, "Hello", MessageKind::Text).await.unwrap();
    let echo = MessageCreated {
        conversation_id: conv.clone(),
        message_id: sent.id.clone(),
        sender_id: "alice".to_string(),
    };
    assert!(!alice.on_message_created(&echo).await.unwrap());
    assert!(!alice.append_if_absent(&sent));

    let state = alice.snapshot();
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].id, sent.id);

    alice.fetch_messages(&conv).await.unwrap();
    assert_eq!(alice.snapshot().messages.len(), 1);
}

#[tokio::test]
async fn test_realtime_message_appended_once_for_active_conversation() {
    let store = scripted().await;
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();
    let other = store
        .create_conversation(&ids(&["alice", "carol"]), None)
        .await
        .unwrap();

    let bob = controller(&store, "bob");
    bob.fetch_messages(&conv).await.unwrap();

    let message = store.insert_message(text(&conv, "alice", "Hi Bob")).await.unwrap();
    let created = MessageCreated {
        conversation_id: conv.clone(),
        message_id: message.id.clone(),
        sender_id: "alice".to_string(),
    };
    assert!(bob.on_message_created(&created).await.unwrap());
    assert!(!bob.on_message_created(&created).await.unwrap());
    assert_eq!(bob.snapshot().messages.len(), 1);

    let elsewhere = store.insert_message(text(&other, "alice", "Hi Carol")).await.unwrap();
    let created = MessageCreated {
        conversation_id: other,
        message_id: elsewhere.id,
        sender_id: "alice".to_string(),
    };
    assert!(!bob.on_message_created(&created).await.unwrap());
    assert_eq!(bob.snapshot().messages.len(), 1);
}

#[tokio::test]
async fn test_mark_read_failure_is_swallowed() {
    let store = scripted().await;
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();
    store.insert_message(text(&conv, "alice", "hi")).await.unwrap();
    store.fail_mark_read.store(true, Ordering::SeqCst);

    let bob = controller(&store, "bob");
    assert_eq!(bob.fetch_messages(&conv).await.unwrap(), FetchOutcome::Loaded(1));
    assert!(store.calls().contains(&"mark_read"));
    assert_eq!(bob.snapshot().error, None);
}

#[tokio::test]
async fn test_history_failure_is_kept_in_state() {
    let store = scripted().await;
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();
    store.insert_message(text(&conv, "alice", "hi")).await.unwrap();
    store.fail_history.store(true, Ordering::SeqCst);

    let bob = controller(&store, "bob");
    assert_eq!(bob.fetch_messages(&conv).await.unwrap(), FetchOutcome::Failed);
    let state = bob.snapshot();
    assert_eq!(state.conversation_id.as_deref(), Some(conv.as_str()));
    assert!(state.error.is_some());
    assert!(state.messages.is_empty());
    assert!(!state.loading);
    assert!(
        !store.calls().contains(&"mark_read"),
        "unseen history must not be marked read"
    );

    store.fail_history.store(false, Ordering::SeqCst);
    assert_eq!(bob.fetch_messages(&conv).await.unwrap(), FetchOutcome::Loaded(1));
    assert_eq!(bob.snapshot().error, None);
}

#[tokio::test]
async fn test_send_failures_reach_the_caller() {
    let store = scripted().await;
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();

    let mallory = controller(&store, "mallory");
    mallory.fetch_messages(&conv).await.unwrap();
    let result = mallory.send(&conv, "let me in", MessageKind::Text).await;
    assert!(matches!(
        result,
        Err(ChatError::Store(StoreError::Validation(_)))
    ));
    assert!(mallory.snapshot().error.is_some());
    assert!(mallory.snapshot().messages.is_empty());

    let alice = controller(&store, "alice");
    let result = alice.send(&conv, "   ", MessageKind::Text).await;
    assert!(matches!(result, Err(ChatError::InvalidMessage(_))));

    let too_long = "x".repeat(rentsync_store::MAX_MESSAGE_LENGTH + 1);
    let result = alice.send(&conv, &too_long, MessageKind::Text).await;
    assert!(matches!(result, Err(ChatError::InvalidMessage(_))));
}

#[tokio::test]
async fn test_send_touches_and_requests_refresh_in_background() {
    let store = scripted().await;
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();
    let refresh = Arc::new(Notify::new());
    let alice = MessageStreamController::new(store.clone(), "alice", refresh.clone());

    let sent = alice.send(&conv, "Hello", MessageKind::Text).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), refresh.notified())
        .await
        .expect("refresh requested");

    let rows = store.inner.conversation_summaries(&[conv]).await.unwrap();
    assert_eq!(
        rows[0].updated_at.timestamp_millis(),
        sent.created_at.timestamp_millis()
    );
}
