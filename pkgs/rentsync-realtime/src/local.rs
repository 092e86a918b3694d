//! In-process transport
//!
//! [`LocalHub`] is a pub/sub hub living in one process. Every call to
//! [`LocalHub::connect`] yields an independent client, standing in for a
//! browser tab or a device, so multi-session behaviour can be exercised
//! without a network.

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RealtimeError;
use crate::registry::{Subscriber, TopicRegistry};
use crate::topic::Topic;
use crate::transport::{Channel, ChannelOptions, Transport, TransportEvents};

#[derive(Default)]
struct HubState {
    registry: TopicRegistry,
    /// Topics whose channels errored; broadcasts are refused until every
    /// subscriber has left
    failed: HashMap<Topic, String>,
}

#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
    next_subscription: Arc<AtomicU64>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client connection identified by `client_id`
    pub fn connect(&self, client_id: impl Into<String>) -> LocalTransport {
        LocalTransport {
            hub: self.clone(),
            client_id: client_id.into(),
        }
    }

    /// Push an error status to every subscriber of `topic` and refuse
    /// further broadcasts on it
    pub fn inject_channel_error(&self, topic: &Topic, reason: &str) {
        warn!("Injecting channel error on {}: {}", topic, reason);
        let mut state = self.state.lock();
        if state.registry.subscriber_count(topic) == 0 {
            return;
        }
        state.registry.fail(topic, reason);
        state.failed.insert(topic.clone(), reason.to_string());
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state.lock().registry.subscriber_count(topic)
    }

    /// Presence keys currently tracked on `topic`
    pub fn presence_keys(&self, topic: &Topic) -> Vec<String> {
        self.state.lock().registry.presence_keys(topic)
    }
}

/// One client of a [`LocalHub`]
#[derive(Clone)]
pub struct LocalTransport {
    hub: LocalHub,
    client_id: String,
}

impl LocalTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn subscribe(
        &self,
        topic: &Topic,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn Channel>, TransportEvents), RealtimeError> {
        if options.private {
            if let Some(owner) = topic.owner() {
                if owner != self.client_id {
                    return Err(RealtimeError::SubscribeRefused {
                        topic: topic.to_string(),
                        reason: format!("{} does not own this topic", self.client_id),
                    });
                }
            }
        }

        let subscription = self.hub.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded();
        self.hub.state.lock().registry.add_subscriber(
            topic,
            subscription,
            Subscriber {
                sender,
                self_echo: options.self_echo,
            },
        );
        debug!(
            "Client {} subscribed to {} (subscription {})",
            self.client_id, topic, subscription
        );

        let channel = LocalChannel {
            hub: self.hub.clone(),
            topic: topic.clone(),
            subscription,
            presence_ref: format!("{}#{}", self.client_id, subscription),
            presence_key: options.presence_key,
            ack: options.ack,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(channel), receiver))
    }
}

pub struct LocalChannel {
    hub: LocalHub,
    topic: Topic,
    subscription: u64,
    presence_ref: String,
    presence_key: Option<String>,
    ack: bool,
    closed: AtomicBool,
}

impl LocalChannel {
    fn ensure_open(&self) -> Result<(), RealtimeError> {
        if self.closed.load(Ordering::Acquire) {
            Err(RealtimeError::ChannelClosed(self.topic.to_string()))
        } else {
            Ok(())
        }
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.hub.state.lock();
        state.registry.untrack(&self.topic, &self.presence_ref);
        if state
            .registry
            .remove_subscriber(&self.topic, self.subscription)
        {
            state.failed.remove(&self.topic);
        }
        true
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), RealtimeError> {
        self.ensure_open()?;
        let mut state = self.hub.state.lock();
        if let Some(reason) = state.failed.get(&self.topic) {
            if self.ack {
                return Err(RealtimeError::PublishFailed {
                    topic: self.topic.to_string(),
                    reason: reason.clone(),
                });
            }
            debug!("Dropping '{}' on errored {}", event, self.topic);
            return Ok(());
        }
        state
            .registry
            .broadcast(&self.topic, Some(self.subscription), event, payload);
        Ok(())
    }

    async fn track(&self, meta: Value) -> Result<(), RealtimeError> {
        self.ensure_open()?;
        let key = self
            .presence_key
            .as_deref()
            .ok_or_else(|| RealtimeError::PresenceKeyMissing(self.topic.to_string()))?;
        self.hub.state.lock().registry.track(
            &self.topic,
            key,
            &self.presence_ref,
            meta,
            false,
            Instant::now(),
        );
        Ok(())
    }

    async fn untrack(&self) -> Result<(), RealtimeError> {
        self.ensure_open()?;
        self.hub
            .state
            .lock()
            .registry
            .untrack(&self.topic, &self.presence_ref);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), RealtimeError> {
        if self.close() {
            debug!("Unsubscribed from {} ({})", self.topic, self.subscription);
        }
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if self.close() {
            debug!("Dropped open channel on {}", self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelStatus, TransportEvent};
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_between_clients() {
        let hub = LocalHub::new();
        let topic = Topic::conversation_messages("conv-1");
        let (alice, _alice_rx) = hub
            .connect("alice")
            .subscribe(&topic, ChannelOptions::default())
            .await
            .unwrap();
        let (_bob, mut bob_rx) = hub
            .connect("bob")
            .subscribe(&topic, ChannelOptions::default())
            .await
            .unwrap();

        assert_eq!(
            bob_rx.next().await,
            Some(TransportEvent::Status(ChannelStatus::Subscribed))
        );
        assert!(matches!(
            bob_rx.next().await,
            Some(TransportEvent::PresenceSync { .. })
        ));

        alice.send("message_created", json!({"id": 1})).await.unwrap();
        assert_eq!(
            bob_rx.next().await,
            Some(TransportEvent::Broadcast {
                event: "message_created".to_string(),
                payload: json!({"id": 1}),
            })
        );
    }

    #[tokio::test]
    async fn test_private_topic_refuses_other_clients() {
        let hub = LocalHub::new();
        let topic = Topic::user_conversations("alice");

        let result = hub
            .connect("mallory")
            .subscribe(&topic, ChannelOptions::default().private())
            .await;
        assert!(matches!(result, Err(RealtimeError::SubscribeRefused { .. })));

        assert!(hub
            .connect("alice")
            .subscribe(&topic, ChannelOptions::default().private())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_release_subscriptions() {
        let hub = LocalHub::new();
        let topic = Topic::presence_global();
        let client = hub.connect("alice");

        let (first, _rx1) = client
            .subscribe(&topic, ChannelOptions::default().with_presence_key("alice"))
            .await
            .unwrap();
        let (second, _rx2) = client
            .subscribe(&topic, ChannelOptions::default())
            .await
            .unwrap();
        first.track(json!({"user_id": "alice"})).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 2);
        assert_eq!(hub.presence_keys(&topic), vec!["alice".to_string()]);

        first.unsubscribe().await.unwrap();
        assert!(hub.presence_keys(&topic).is_empty());
        assert!(matches!(
            first.send("x", json!({})).await,
            Err(RealtimeError::ChannelClosed(_))
        ));

        drop(second);
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_ack_reports_refused_broadcasts() {
        let hub = LocalHub::new();
        let topic = Topic::conversation_messages("conv-1");
        let (acked, _acked_rx) = hub
            .connect("alice")
            .subscribe(&topic, ChannelOptions::default().with_ack())
            .await
            .unwrap();
        let (fire_and_forget, _ff_rx) = hub
            .connect("alice")
            .subscribe(&topic, ChannelOptions::default())
            .await
            .unwrap();
        let (_bob, mut bob_rx) = hub
            .connect("bob")
            .subscribe(&topic, ChannelOptions::default())
            .await
            .unwrap();
        bob_rx.next().await;
        bob_rx.next().await;

        acked.send("message_created", json!({"n": 1})).await.unwrap();
        assert!(matches!(
            bob_rx.next().await,
            Some(TransportEvent::Broadcast { .. })
        ));

        hub.inject_channel_error(&topic, "boom");
        assert_eq!(
            bob_rx.next().await,
            Some(TransportEvent::Status(ChannelStatus::Errored("boom".to_string())))
        );

        let refused = acked.send("message_created", json!({"n": 2})).await;
        assert!(matches!(
            refused,
            Err(RealtimeError::PublishFailed { ref reason, .. }) if reason == "boom"
        ));
        fire_and_forget
            .send("message_created", json!({"n": 3}))
            .await
            .unwrap();
        assert!(bob_rx.try_next().is_err(), "refused broadcasts are not delivered");
    }

    #[tokio::test]
    async fn test_channel_error_clears_once_topic_is_empty() {
        let hub = LocalHub::new();
        let topic = Topic::conversation_messages("conv-1");
        let client = hub.connect("alice");

        let (first, _rx) = client
            .subscribe(&topic, ChannelOptions::default().with_ack())
            .await
            .unwrap();
        hub.inject_channel_error(&topic, "boom");
        first.unsubscribe().await.unwrap();

        let (second, _rx) = client
            .subscribe(&topic, ChannelOptions::default().with_ack())
            .await
            .unwrap();
        assert!(second.send("message_created", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_track_requires_presence_key() {
        let hub = LocalHub::new();
        let (channel, _rx) = hub
            .connect("alice")
            .subscribe(&Topic::presence_global(), ChannelOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            channel.track(json!({})).await,
            Err(RealtimeError::PresenceKeyMissing(_))
        ));
    }
}
