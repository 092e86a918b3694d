//! Presence tracking over the in-process hub

use async_trait::async_trait;
use rentsync_realtime::{
    Channel, ChannelOptions, LocalHub, PresenceTracker, RealtimeError, Topic, Transport,
    TransportEvents,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const HEARTBEAT: Duration = Duration::from_secs(30);

/// Yield until `condition` holds, panicking if it never does
async fn settle(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

async fn yield_many() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn tracker(hub: &LocalHub, client: &str) -> PresenceTracker {
    let (tracker, _updates) = PresenceTracker::new(Arc::new(hub.connect(client)), HEARTBEAT);
    tracker
}

#[tokio::test]
async fn test_users_see_each_other_and_logout_goes_offline() {
    let hub = LocalHub::new();
    let alice = tracker(&hub, "alice");
    let bob = tracker(&hub, "bob");

    alice.start("alice").await.unwrap();
    bob.start("bob").await.unwrap();

    settle(|| alice.is_online("bob") && bob.is_online("alice")).await;
    assert!(alice.is_online("alice"));

    bob.stop().await;
    settle(|| !alice.is_online("bob")).await;
    assert!(bob.online_users().is_empty());
    assert_eq!(hub.subscriber_count(&Topic::presence_global()), 1);
}

#[tokio::test]
async fn test_second_tab_keeps_user_online() {
    let hub = LocalHub::new();
    let watcher = tracker(&hub, "carol");
    let first_tab = tracker(&hub, "alice");
    let second_tab = tracker(&hub, "alice");

    watcher.start("carol").await.unwrap();
    first_tab.start("alice").await.unwrap();
    second_tab.start("alice").await.unwrap();
    settle(|| watcher.is_online("alice")).await;

    first_tab.stop().await;
    yield_many().await;
    assert!(watcher.is_online("alice"));

    second_tab.stop().await;
    settle(|| !watcher.is_online("alice")).await;
}

#[tokio::test(start_paused = true)]
async fn test_visibility_round_trip_announces_once() {
    let hub = LocalHub::new();
    let alice = tracker(&hub, "alice");
    let bob = tracker(&hub, "bob");
    bob.start("bob").await.unwrap();
    alice.start("alice").await.unwrap();
    assert_eq!(alice.announce_count(), 1);
    settle(|| bob.is_online("alice")).await;

    alice.set_visibility(false).await;
    settle(|| !bob.is_online("alice")).await;
    for _ in 0..3 {
        tokio::time::advance(HEARTBEAT).await;
        yield_many().await;
    }
    assert_eq!(alice.announce_count(), 1);

    alice.set_visibility(true).await;
    alice.set_visibility(true).await;
    assert_eq!(alice.announce_count(), 2);
    settle(|| bob.is_online("alice")).await;

    tokio::time::advance(HEARTBEAT).await;
    yield_many().await;
    assert_eq!(alice.announce_count(), 3);

    tokio::time::advance(HEARTBEAT).await;
    yield_many().await;
    assert_eq!(alice.announce_count(), 4);
}

#[tokio::test]
async fn test_hidden_before_start_does_not_announce() {
    let hub = LocalHub::new();
    let alice = tracker(&hub, "alice");

    alice.set_visibility(false).await;
    alice.start("alice").await.unwrap();
    assert_eq!(alice.announce_count(), 0);
    assert!(hub.presence_keys(&Topic::presence_global()).is_empty());

    alice.set_visibility(true).await;
    assert_eq!(alice.announce_count(), 1);
    assert_eq!(
        hub.presence_keys(&Topic::presence_global()),
        vec!["alice".to_string()]
    );
}

/// Transport whose subscribe blocks until released
struct GatedTransport {
    inner: rentsync_realtime::LocalTransport,
    gate: Arc<Notify>,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn subscribe(
        &self,
        topic: &Topic,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn Channel>, TransportEvents), RealtimeError> {
        self.gate.notified().await;
        self.inner.subscribe(topic, options).await
    }
}

#[tokio::test]
async fn test_logout_before_first_announce_leaves_nothing_behind() {
    let hub = LocalHub::new();
    let gate = Arc::new(Notify::new());
    let transport = GatedTransport {
        inner: hub.connect("alice"),
        gate: gate.clone(),
    };
    let (alice, _updates) = PresenceTracker::new(Arc::new(transport), HEARTBEAT);
    let alice = Arc::new(alice);

    let starting = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.start("alice").await })
    };
    yield_many().await;

    alice.stop().await;
    gate.notify_one();
    starting.await.unwrap().unwrap();

    assert_eq!(alice.announce_count(), 0);
    assert_eq!(hub.subscriber_count(&Topic::presence_global()), 0);
    assert!(hub.presence_keys(&Topic::presence_global()).is_empty());
}

#[tokio::test]
async fn test_malformed_presence_is_ignored() {
    let hub = LocalHub::new();
    let alice = tracker(&hub, "alice");
    alice.start("alice").await.unwrap();

    let (forged, _rx) = hub
        .connect("mallory")
        .subscribe(
            &Topic::presence_global(),
            ChannelOptions::default().with_presence_key("mallory"),
        )
        .await
        .unwrap();
    forged
        .track(json!({"user_id": "someone-else", "online_at": "2025-01-01T00:00:00Z", "status": "online"}))
        .await
        .unwrap();
    yield_many().await;
    assert!(!alice.is_online("mallory"));
    assert!(!alice.is_online("someone-else"));

    forged
        .track(json!({"user_id": "mallory", "online_at": "2025-01-01T00:00:00Z", "status": "online"}))
        .await
        .unwrap();
    settle(|| alice.is_online("mallory")).await;
}
