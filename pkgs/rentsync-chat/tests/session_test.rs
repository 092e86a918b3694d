//! End-to-end tests for ChatSession over an in-process hub

mod common;

use common::{eventually, ids, memory_store, ScriptedStore};
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use rentsync_chat::{ChatConfig, ChatError, ChatEvent, ChatSession, FetchOutcome};
use rentsync_realtime::{LocalHub, Topic};
use rentsync_store::{DataStore, MemoryUnreadHints, SqliteStore, UnreadHints};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Client {
    session: ChatSession,
    events: UnboundedReceiver<ChatEvent>,
    hints: Arc<MemoryUnreadHints>,
}

fn test_config() -> ChatConfig {
    ChatConfig {
        typing_silence_window: Duration::from_millis(400),
        ..ChatConfig::default()
    }
}

async fn login(hub: &LocalHub, store: &Arc<SqliteStore>, user_id: &str) -> Client {
    let hints = Arc::new(MemoryUnreadHints::new());
    let (session, events) = ChatSession::start(
        user_id,
        store.clone(),
        hints.clone(),
        Arc::new(hub.connect(user_id)),
        test_config(),
    )
    .await
    .expect("session should start");
    Client {
        session,
        events,
        hints,
    }
}

async fn alice_and_bob() -> (LocalHub, Arc<SqliteStore>, Client, Client) {
    let hub = LocalHub::new();
    let store = Arc::new(memory_store().await);
    let alice = login(&hub, &store, "alice").await;
    let bob = login(&hub, &store, "bob").await;
    (hub, store, alice, bob)
}

async fn wait_for_event(
    events: &mut UnboundedReceiver<ChatEvent>,
    wanted: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = events.next().await {
            if wanted(&event) {
                return event;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("event not received in time")
}

async fn hint_becomes(
    hints: &MemoryUnreadHints,
    user_id: &str,
    conversation_id: &str,
    unread: bool,
) {
    for _ in 0..200 {
        if hints.get(user_id, conversation_id).await.unwrap() == Some(unread) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("hint for {} never became {}", conversation_id, unread);
}

fn unread_of(session: &ChatSession, conversation_id: &str) -> Option<(u32, bool)> {
    session
        .conversations()
        .conversations
        .iter()
        .find(|c| c.id == conversation_id)
        .map(|c| (c.unread_count, c.is_unread))
}

#[tokio::test]
async fn test_new_conversation_reaches_other_participant() {
    let (_hub, _store, alice, bob) = alice_and_bob().await;

    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();
    assert!(alice.session.known_conversations().contains(&conv));

    eventually(|| bob.session.known_conversations().contains(&conv)).await;
    eventually(|| unread_of(&bob.session, &conv).is_some()).await;
}

#[tokio::test]
async fn test_message_shown_once_to_open_viewer() {
    let (_hub, _store, alice, bob) = alice_and_bob().await;
    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();

    alice.session.fetch_messages(&conv).await.unwrap();
    bob.session.fetch_messages(&conv).await.unwrap();

    let sent = alice.session.send_message(&conv, "Hello").await.unwrap();

    eventually(|| bob.session.messages().messages.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bob_view = bob.session.messages();
    assert_eq!(bob_view.messages.len(), 1);
    assert_eq!(bob_view.messages[0].id, sent.id);
    assert_eq!(bob_view.messages[0].content, "Hello");

    let alice_view = alice.session.messages();
    assert_eq!(alice_view.messages.len(), 1);
}

#[tokio::test]
async fn test_unread_until_recipient_opens_conversation() {
    let (_hub, _store, alice, bob) = alice_and_bob().await;
    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();

    alice.session.fetch_messages(&conv).await.unwrap();
    alice.session.send_message(&conv, "Hello").await.unwrap();

    eventually(|| unread_of(&bob.session, &conv) == Some((1, true))).await;
    eventually(|| unread_of(&alice.session, &conv) == Some((0, false))).await;
    hint_becomes(&bob.hints, "bob", &conv, true).await;

    assert_eq!(
        bob.session.fetch_messages(&conv).await.unwrap(),
        FetchOutcome::Loaded(1)
    );
    eventually(|| unread_of(&bob.session, &conv) == Some((0, false))).await;
    assert_eq!(bob.hints.get("bob", &conv).await.unwrap(), Some(false));
}

#[tokio::test]
async fn test_typing_shown_to_peer_and_cleared_on_send() {
    let (_hub, _store, alice, mut bob) = alice_and_bob().await;
    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();

    assert!(matches!(
        alice.session.notify_typing("Hel").await,
        Err(ChatError::NoActiveConversation)
    ));

    alice.session.fetch_messages(&conv).await.unwrap();
    bob.session.fetch_messages(&conv).await.unwrap();

    alice.session.notify_typing("Hel").await.unwrap();
    let event = wait_for_event(&mut bob.events, |e| {
        matches!(e, ChatEvent::TypingChanged { users, .. } if !users.is_empty())
    })
    .await;
    assert_eq!(
        event,
        ChatEvent::TypingChanged {
            conversation_id: conv.clone(),
            users: vec!["alice".to_string()],
        }
    );
    assert_eq!(bob.session.typing_users(), vec!["alice".to_string()]);
    assert!(alice.session.typing_users().is_empty());

    alice.session.send_message(&conv, "Hello").await.unwrap();
    eventually(|| bob.session.typing_users().is_empty()).await;
}

#[tokio::test]
async fn test_typing_clears_after_silence() {
    let (_hub, _store, alice, bob) = alice_and_bob().await;
    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();
    alice.session.fetch_messages(&conv).await.unwrap();
    bob.session.fetch_messages(&conv).await.unwrap();

    alice.session.notify_typing("Hel").await.unwrap();
    eventually(|| !bob.session.typing_users().is_empty()).await;
    eventually(|| bob.session.typing_users().is_empty()).await;
}

#[tokio::test]
async fn test_presence_follows_login_and_logout() {
    let (hub, _store, alice, bob) = alice_and_bob().await;

    eventually(|| alice.session.is_online("bob") && bob.session.is_online("alice")).await;
    assert_eq!(hub.subscriber_count(&Topic::presence_global()), 2);
    assert_eq!(hub.subscriber_count(&Topic::user_conversations("bob")), 1);

    bob.session.logout().await;

    eventually(|| !alice.session.is_online("bob")).await;
    assert!(alice.session.is_online("alice"));
    assert!(!bob.session.is_online("alice"));
    assert_eq!(hub.subscriber_count(&Topic::presence_global()), 1);
    assert_eq!(hub.subscriber_count(&Topic::user_conversations("bob")), 0);
}

#[tokio::test]
async fn test_hidden_client_goes_offline_for_peers() {
    let (_hub, _store, alice, bob) = alice_and_bob().await;
    eventually(|| alice.session.is_online("bob")).await;

    bob.session.set_visibility(false).await;
    eventually(|| !alice.session.is_online("bob")).await;

    bob.session.set_visibility(true).await;
    eventually(|| alice.session.is_online("bob")).await;
}

#[tokio::test]
async fn test_history_failure_is_rendered_not_raised() {
    let hub = LocalHub::new();
    let store = Arc::new(ScriptedStore::new(memory_store().await));
    let conv = store
        .create_conversation(&ids(&["alice", "bob"]), None)
        .await
        .unwrap();
    let (session, mut events) = ChatSession::start(
        "bob",
        store.clone(),
        Arc::new(MemoryUnreadHints::new()),
        Arc::new(hub.connect("bob")),
        test_config(),
    )
    .await
    .unwrap();

    store.fail_history.store(true, Ordering::SeqCst);
    assert_eq!(session.fetch_messages(&conv).await.unwrap(), FetchOutcome::Failed);
    wait_for_event(&mut events, |e| {
        *e == ChatEvent::MessagesUpdated {
            conversation_id: conv.clone(),
        }
    })
    .await;

    let state = session.messages();
    assert!(state.error.is_some());
    assert!(state.messages.is_empty());
    assert!(!state.loading);
}

#[tokio::test]
async fn test_channel_error_is_surfaced() {
    let (hub, _store, mut alice, _bob) = alice_and_bob().await;
    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();
    alice.session.fetch_messages(&conv).await.unwrap();
    assert!(!alice.session.channel_error());

    let topic = Topic::conversation_messages(&conv);
    hub.inject_channel_error(&topic, "boom");

    let event = wait_for_event(&mut alice.events, |e| {
        matches!(e, ChatEvent::ChannelError { .. })
    })
    .await;
    assert_eq!(
        event,
        ChatEvent::ChannelError {
            topic: topic.to_string(),
            reason: "boom".to_string(),
        }
    );
    assert!(alice.session.channel_error());
}

#[tokio::test]
async fn test_get_or_create_reuses_and_validates() {
    let (_hub, _store, alice, _bob) = alice_and_bob().await;

    let first = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();
    let again = alice
        .session
        .get_or_create_conversation(&["bob".to_string(), "alice".to_string()], None)
        .await
        .unwrap();
    assert_eq!(first, again);

    let result = alice
        .session
        .get_or_create_conversation(&["alice".to_string()], None)
        .await;
    assert!(matches!(result, Err(ChatError::InvalidParticipants(_))));

    let result = alice
        .session
        .get_or_create_conversation(&["  ".to_string()], None)
        .await;
    assert!(matches!(result, Err(ChatError::InvalidParticipants(_))));
}

#[tokio::test]
async fn test_calls_after_logout_fail() {
    let (_hub, _store, alice, _bob) = alice_and_bob().await;
    let conv = alice
        .session
        .get_or_create_conversation(&["bob".to_string()], None)
        .await
        .unwrap();
    alice.session.fetch_messages(&conv).await.unwrap();

    alice.session.logout().await;
    alice.session.logout().await;

    assert!(alice.session.active_conversation().is_none());
    assert!(alice.session.conversations().conversations.is_empty());
    assert!(matches!(
        alice.session.fetch_messages(&conv).await,
        Err(ChatError::SessionClosed)
    ));
    assert!(matches!(
        alice.session.send_message(&conv, "late").await,
        Err(ChatError::SessionClosed)
    ));
}
