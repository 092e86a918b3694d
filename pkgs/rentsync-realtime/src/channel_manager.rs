//! Subscription lifecycle for the active conversation and the user channel
//!
//! The manager owns at most one conversation scope (messages + typing topics)
//! and one per-user channel. Every subscription is paired with an
//! unsubscribe: opening another conversation, closing, or dropping the manager
//! tears the previous scope down. Inbound broadcasts are decoded and forwarded
//! as [`ManagerEvent`]s.

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::RealtimeError;
use crate::events::{Decoded, RealtimeEvent, TypingSignal};
use crate::topic::Topic;
use crate::transport::{Channel, ChannelOptions, ChannelStatus, Transport, TransportEvent, TransportEvents};

/// Which subscription an event arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Conversation(String),
    User(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Realtime { scope: Scope, event: RealtimeEvent },
    Status { scope: Scope, topic: Topic, status: ChannelStatus },
}

struct OpenChannel {
    channel: Arc<dyn Channel>,
    pump: JoinHandle<()>,
}

impl OpenChannel {
    async fn close(self) {
        if let Err(e) = self.channel.unsubscribe().await {
            warn!("Failed to unsubscribe from {}: {}", self.channel.topic(), e);
        }
    }
}

impl Drop for OpenChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct ConversationScope {
    conversation_id: String,
    messages: OpenChannel,
    typing: OpenChannel,
}

struct UserScope {
    user_id: String,
    channel: OpenChannel,
}

pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    conversation: Mutex<Option<ConversationScope>>,
    user: Mutex<Option<UserScope>>,
    active_conversation: SyncMutex<Option<String>>,
    errored: Arc<AtomicBool>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, receiver) = mpsc::unbounded();
        let manager = Self {
            transport,
            events,
            conversation: Mutex::new(None),
            user: Mutex::new(None),
            active_conversation: SyncMutex::new(None),
            errored: Arc::new(AtomicBool::new(false)),
        };
        (manager, receiver)
    }

    /// Open the scope for `conversation_id`, tearing down any other one.
    /// Returns false when that conversation was already open.
    #[instrument(skip(self))]
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<bool, RealtimeError> {
        let mut slot = self.conversation.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.conversation_id == conversation_id {
                return Ok(false);
            }
        }

        if let Some(previous) = slot.take() {
            *self.active_conversation.lock() = None;
            debug!("Closing conversation scope {}", previous.conversation_id);
            previous.messages.close().await;
            previous.typing.close().await;
        }

        let scope = Scope::Conversation(conversation_id.to_string());
        let messages = self
            .open(
                Topic::conversation_messages(conversation_id),
                ChannelOptions::default(),
                scope.clone(),
            )
            .await?;
        let typing = match self
            .open(
                Topic::conversation_typing(conversation_id),
                ChannelOptions::default(),
                scope,
            )
            .await
        {
            Ok(typing) => typing,
            Err(e) => {
                messages.close().await;
                return Err(e);
            }
        };

        *slot = Some(ConversationScope {
            conversation_id: conversation_id.to_string(),
            messages,
            typing,
        });
        *self.active_conversation.lock() = Some(conversation_id.to_string());
        info!("Opened conversation scope {}", conversation_id);
        Ok(true)
    }

    pub async fn close_conversation(&self) {
        let previous = self.conversation.lock().await.take();
        *self.active_conversation.lock() = None;
        if let Some(previous) = previous {
            debug!("Closing conversation scope {}", previous.conversation_id);
            previous.messages.close().await;
            previous.typing.close().await;
        }
    }

    /// Open the private per-user channel; a no-op for the same user
    #[instrument(skip(self))]
    pub async fn open_user(&self, user_id: &str) -> Result<bool, RealtimeError> {
        let mut slot = self.user.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.user_id == user_id {
                return Ok(false);
            }
        }
        if let Some(previous) = slot.take() {
            previous.channel.close().await;
        }

        let channel = self
            .open(
                Topic::user_conversations(user_id),
                ChannelOptions::default().private(),
                Scope::User(user_id.to_string()),
            )
            .await?;
        *slot = Some(UserScope {
            user_id: user_id.to_string(),
            channel,
        });
        info!("Opened user channel for {}", user_id);
        Ok(true)
    }

    pub async fn close_user(&self) {
        let previous = self.user.lock().await.take();
        if let Some(previous) = previous {
            previous.channel.close().await;
        }
    }

    pub async fn close_all(&self) {
        self.close_conversation().await;
        self.close_user().await;
    }

    /// Id of the conversation whose scope is open
    pub fn active_conversation(&self) -> Option<String> {
        self.active_conversation.lock().clone()
    }

    /// Set once any channel reported an error or timeout; never cleared automatically
    pub fn channel_error(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    pub fn clear_channel_error(&self) {
        self.errored.store(false, Ordering::Release);
    }

    /// Send a typing signal on the open conversation's typing topic
    pub async fn send_typing(&self, signal: &TypingSignal) -> Result<(), RealtimeError> {
        let channel = {
            let slot = self.conversation.lock().await;
            match slot.as_ref() {
                Some(scope) if scope.conversation_id == signal.conversation_id => {
                    scope.typing.channel.clone()
                }
                _ => {
                    return Err(RealtimeError::ChannelClosed(
                        Topic::conversation_typing(&signal.conversation_id).to_string(),
                    ))
                }
            }
        };

        let event = RealtimeEvent::Typing(signal.clone());
        channel.send(event.event_name(), event.to_payload()?).await
    }

    /// Broadcast `event` on `topic`, reusing an open channel when there is one
    /// and otherwise subscribing just long enough to send
    #[instrument(skip(self, event), fields(event = event.event_name()))]
    pub async fn publish(&self, topic: &Topic, event: &RealtimeEvent) -> Result<(), RealtimeError> {
        let payload = event.to_payload()?;

        if let Some(channel) = self.find_open(topic).await {
            return channel.send(event.event_name(), payload).await;
        }

        let (channel, _events) = self
            .transport
            .subscribe(topic, ChannelOptions::default().with_ack())
            .await?;
        let result = channel.send(event.event_name(), payload).await;
        if let Err(e) = channel.unsubscribe().await {
            warn!("Failed to close transient channel {}: {}", topic, e);
        }
        result
    }

    async fn find_open(&self, topic: &Topic) -> Option<Arc<dyn Channel>> {
        if let Some(scope) = self.conversation.lock().await.as_ref() {
            for open in [&scope.messages, &scope.typing] {
                if open.channel.topic() == topic {
                    return Some(open.channel.clone());
                }
            }
        }
        if let Some(scope) = self.user.lock().await.as_ref() {
            if scope.channel.channel.topic() == topic {
                return Some(scope.channel.channel.clone());
            }
        }
        None
    }

    async fn open(
        &self,
        topic: Topic,
        options: ChannelOptions,
        scope: Scope,
    ) -> Result<OpenChannel, RealtimeError> {
        let (channel, receiver) = self.transport.subscribe(&topic, options).await?;
        let pump = tokio::spawn(pump_events(
            scope,
            topic,
            receiver,
            self.events.clone(),
            self.errored.clone(),
        ));
        Ok(OpenChannel { channel, pump })
    }
}

async fn pump_events(
    scope: Scope,
    topic: Topic,
    mut receiver: TransportEvents,
    events: mpsc::UnboundedSender<ManagerEvent>,
    errored: Arc<AtomicBool>,
) {
    while let Some(event) = receiver.next().await {
        let forwarded = match event {
            TransportEvent::Broadcast { event, payload } => {
                match RealtimeEvent::decode(&event, &payload) {
                    Decoded::Event(event) => ManagerEvent::Realtime {
                        scope: scope.clone(),
                        event,
                    },
                    Decoded::Rejected { event, reason } => {
                        warn!("Dropping malformed '{}' on {}: {}", event, topic, reason);
                        continue;
                    }
                }
            }
            TransportEvent::Status(status) => {
                if status.is_failure() {
                    warn!("Channel {} reported {:?}", topic, status);
                    errored.store(true, Ordering::Release);
                }
                ManagerEvent::Status {
                    scope: scope.clone(),
                    topic: topic.clone(),
                    status,
                }
            }
            _ => continue,
        };

        if events.unbounded_send(forwarded).is_err() {
            debug!("Event receiver dropped, stopping pump for {}", topic);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MessageCreated, ParticipantAdded};
    use crate::local::LocalHub;
    use chrono::Utc;
    use serde_json::json;

    fn message_created(conversation_id: &str) -> RealtimeEvent {
        RealtimeEvent::MessageCreated(MessageCreated {
            conversation_id: conversation_id.to_string(),
            message_id: "msg-1".to_string(),
            sender_id: "bob".to_string(),
        })
    }

    async fn next_realtime(
        receiver: &mut mpsc::UnboundedReceiver<ManagerEvent>,
    ) -> (Scope, RealtimeEvent) {
        loop {
            match receiver.next().await {
                Some(ManagerEvent::Realtime { scope, event }) => return (scope, event),
                Some(ManagerEvent::Status { .. }) => continue,
                None => panic!("manager event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_switching_conversations_tears_down_previous_scope() {
        let hub = LocalHub::new();
        let (manager, _events) = ChannelManager::new(Arc::new(hub.connect("alice")));

        assert!(manager.open_conversation("conv-1").await.unwrap());
        assert!(!manager.open_conversation("conv-1").await.unwrap());
        assert_eq!(hub.subscriber_count(&Topic::conversation_messages("conv-1")), 1);
        assert_eq!(hub.subscriber_count(&Topic::conversation_typing("conv-1")), 1);

        assert!(manager.open_conversation("conv-2").await.unwrap());
        assert_eq!(hub.subscriber_count(&Topic::conversation_messages("conv-1")), 0);
        assert_eq!(hub.subscriber_count(&Topic::conversation_typing("conv-1")), 0);
        assert_eq!(hub.subscriber_count(&Topic::conversation_messages("conv-2")), 1);
        assert_eq!(manager.active_conversation().as_deref(), Some("conv-2"));

        manager.close_all().await;
        assert_eq!(hub.subscriber_count(&Topic::conversation_messages("conv-2")), 0);
        assert_eq!(manager.active_conversation(), None);
    }

    #[tokio::test]
    async fn test_inbound_events_are_scoped_and_malformed_ones_dropped() {
        let hub = LocalHub::new();
        let (manager, mut events) = ChannelManager::new(Arc::new(hub.connect("alice")));
        manager.open_conversation("conv-1").await.unwrap();
        manager.open_user("alice").await.unwrap();

        let (bob, _rx) = hub
            .connect("bob")
            .subscribe(
                &Topic::conversation_messages("conv-1"),
                ChannelOptions::default(),
            )
            .await
            .unwrap();
        bob.send("message_created", json!({"conversation_id": "conv-1"}))
            .await
            .unwrap();
        bob.send("message_created", message_created("conv-1").to_payload().unwrap())
            .await
            .unwrap();

        let (scope, event) = next_realtime(&mut events).await;
        assert_eq!(scope, Scope::Conversation("conv-1".to_string()));
        assert_eq!(event, message_created("conv-1"));

        let added = RealtimeEvent::ParticipantAdded(ParticipantAdded {
            conversation_id: "conv-9".to_string(),
            user_id: "alice".to_string(),
        });
        let (bob_manager, _bob_events) = ChannelManager::new(Arc::new(hub.connect("bob")));
        bob_manager
            .publish(&Topic::user_conversations("alice"), &added)
            .await
            .unwrap();

        let (scope, event) = next_realtime(&mut events).await;
        assert_eq!(scope, Scope::User("alice".to_string()));
        assert_eq!(event, added);
        assert_eq!(hub.subscriber_count(&Topic::user_conversations("alice")), 1);
    }

    #[tokio::test]
    async fn test_channel_error_sets_flag() {
        let hub = LocalHub::new();
        let (manager, _events) = ChannelManager::new(Arc::new(hub.connect("alice")));
        manager.open_conversation("conv-1").await.unwrap();
        assert!(!manager.channel_error());

        hub.inject_channel_error(&Topic::conversation_messages("conv-1"), "socket closed");
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !manager.channel_error() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_send_typing_requires_open_scope() {
        let hub = LocalHub::new();
        let (manager, _events) = ChannelManager::new(Arc::new(hub.connect("alice")));
        let signal = TypingSignal {
            conversation_id: "conv-1".to_string(),
            user_id: "alice".to_string(),
            is_typing: true,
            at: Utc::now(),
        };
        assert!(matches!(
            manager.send_typing(&signal).await,
            Err(RealtimeError::ChannelClosed(_))
        ));

        manager.open_conversation("conv-1").await.unwrap();
        assert!(manager.send_typing(&signal).await.is_ok());
    }
}
