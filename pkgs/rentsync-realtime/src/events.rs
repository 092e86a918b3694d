//! Realtime payloads and their boundary decoding
//!
//! Everything arriving over a channel is decoded here into a [`RealtimeEvent`]
//! or turned into a [`Decoded::Rejected`] value that callers log and drop.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RealtimeError;

pub const MESSAGE_CREATED: &str = "message_created";
pub const PARTICIPANT_ADDED: &str = "participant_added";
pub const TYPING: &str = "typing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreated {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantAdded {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealtimeEvent {
    MessageCreated(MessageCreated),
    ParticipantAdded(ParticipantAdded),
    Typing(TypingSignal),
}

/// Result of decoding an inbound broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(RealtimeEvent),
    Rejected { event: String, reason: String },
}

impl RealtimeEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageCreated(_) => MESSAGE_CREATED,
            RealtimeEvent::ParticipantAdded(_) => PARTICIPANT_ADDED,
            RealtimeEvent::Typing(_) => TYPING,
        }
    }

    /// Payload as sent on the wire (without the event name)
    pub fn to_payload(&self) -> Result<Value, RealtimeError> {
        let payload = match self {
            RealtimeEvent::MessageCreated(inner) => serde_json::to_value(inner)?,
            RealtimeEvent::ParticipantAdded(inner) => serde_json::to_value(inner)?,
            RealtimeEvent::Typing(inner) => serde_json::to_value(inner)?,
        };
        Ok(payload)
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            RealtimeEvent::MessageCreated(inner) => &inner.conversation_id,
            RealtimeEvent::ParticipantAdded(inner) => &inner.conversation_id,
            RealtimeEvent::Typing(inner) => &inner.conversation_id,
        }
    }

    pub fn decode(event: &str, payload: &Value) -> Decoded {
        let result = match event {
            MESSAGE_CREATED => parse::<MessageCreated>(payload).and_then(|inner| {
                require("conversation_id", &inner.conversation_id)?;
                require("message_id", &inner.message_id)?;
                require("sender_id", &inner.sender_id)?;
                Ok(RealtimeEvent::MessageCreated(inner))
            }),
            PARTICIPANT_ADDED => parse::<ParticipantAdded>(payload).and_then(|inner| {
                require("conversation_id", &inner.conversation_id)?;
                require("user_id", &inner.user_id)?;
                Ok(RealtimeEvent::ParticipantAdded(inner))
            }),
            TYPING => parse::<TypingSignal>(payload).and_then(|inner| {
                require("conversation_id", &inner.conversation_id)?;
                require("user_id", &inner.user_id)?;
                Ok(RealtimeEvent::Typing(inner))
            }),
            _ => Err("unknown event".to_string()),
        };

        match result {
            Ok(decoded) => Decoded::Event(decoded),
            Err(reason) => Decoded::Rejected {
                event: event.to_string(),
                reason,
            },
        }
    }
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} is empty", field))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
}

/// Meta announced on the presence topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: String,
    pub online_at: DateTime<Utc>,
    pub status: PresenceStatus,
}

impl PresenceMeta {
    pub fn online(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            online_at: Utc::now(),
            status: PresenceStatus::Online,
        }
    }

    pub fn to_value(&self) -> Result<Value, RealtimeError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a meta received under presence `key`
    pub fn from_value(key: &str, value: &Value) -> Result<Self, RealtimeError> {
        let meta: PresenceMeta =
            serde_json::from_value(value.clone()).map_err(|e| RealtimeError::PayloadRejected {
                event: "presence".to_string(),
                reason: e.to_string(),
            })?;

        if meta.user_id.trim().is_empty() || meta.user_id != key {
            return Err(RealtimeError::PayloadRejected {
                event: "presence".to_string(),
                reason: format!("user_id '{}' does not match key '{}'", meta.user_id, key),
            });
        }
        Ok(meta)
    }
}
