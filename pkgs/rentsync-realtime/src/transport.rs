//! Pub/sub transport abstraction
//!
//! A [`Transport`] hands out one [`Channel`] per subscription together with
//! the stream of [`TransportEvent`]s delivered on it. Channels carry named
//! broadcasts plus a presence map keyed by an application-chosen key.

use async_trait::async_trait;
use futures::channel::mpsc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RealtimeError;
use crate::topic::Topic;

/// Full presence state of a topic: presence key -> metas of every session
pub type PresenceState = BTreeMap<String, Vec<Value>>;

/// Stream of events delivered on one subscription
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Options applied when subscribing to a topic
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Deliver our own broadcasts back to us
    pub self_echo: bool,
    /// `send` waits until the transport accepted the broadcast and reports
    /// a rejection as an error; otherwise rejected broadcasts are dropped
    pub ack: bool,
    /// Topic restricted to its owner
    pub private: bool,
    /// Key under which `track` registers presence
    pub presence_key: Option<String>,
}

impl ChannelOptions {
    pub fn with_self_echo(mut self) -> Self {
        self.self_echo = true;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.ack = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Errored(String),
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Errored(_) | ChannelStatus::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ChannelStatus),
    Broadcast { event: String, payload: Value },
    PresenceSync { state: PresenceState },
    PresenceJoin { key: String, metas: Vec<Value> },
    PresenceLeave { key: String, metas: Vec<Value> },
}

/// One subscription to a topic
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &Topic;

    /// Broadcast a named event to the topic
    async fn send(&self, event: &str, payload: Value) -> Result<(), RealtimeError>;

    /// Register (or refresh) this session's presence under the presence key
    async fn track(&self, meta: Value) -> Result<(), RealtimeError>;

    /// Withdraw this session's presence
    async fn untrack(&self) -> Result<(), RealtimeError>;

    /// End the subscription; any presence is withdrawn and the event stream closes
    async fn unsubscribe(&self) -> Result<(), RealtimeError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        topic: &Topic,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn Channel>, TransportEvents), RealtimeError>;
}
