//! Topic naming for the realtime scopes

use std::fmt;

use crate::error::RealtimeError;

const ROOM_PREFIX: &str = "room";
const USER_PREFIX: &str = "user";
const MESSAGES_SUFFIX: &str = "messages";
const TYPING_SUFFIX: &str = "typing";
const CONVERSATIONS_SUFFIX: &str = "conversations";

/// Name of the global presence topic
pub const PRESENCE_GLOBAL: &str = "presence:global";

/// A pub/sub topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// `room:{conversation_id}:messages`
    pub fn conversation_messages(conversation_id: &str) -> Self {
        Self(format!("{}:{}:{}", ROOM_PREFIX, conversation_id, MESSAGES_SUFFIX))
    }

    /// `room:{conversation_id}:typing`
    pub fn conversation_typing(conversation_id: &str) -> Self {
        Self(format!("{}:{}:{}", ROOM_PREFIX, conversation_id, TYPING_SUFFIX))
    }

    /// `user:{user_id}:conversations`
    pub fn user_conversations(user_id: &str) -> Self {
        Self(format!("{}:{}:{}", USER_PREFIX, user_id, CONVERSATIONS_SUFFIX))
    }

    pub fn presence_global() -> Self {
        Self(PRESENCE_GLOBAL.to_string())
    }

    /// Parse and validate a topic name received from outside the process
    pub fn parse(name: &str) -> Result<Self, RealtimeError> {
        if name == PRESENCE_GLOBAL {
            return Ok(Self::presence_global());
        }

        let mut parts = name.splitn(3, ':');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(ROOM_PREFIX), Some(id), Some(MESSAGES_SUFFIX | TYPING_SUFFIX)) => !id.is_empty(),
            (Some(USER_PREFIX), Some(id), Some(CONVERSATIONS_SUFFIX)) => !id.is_empty(),
            _ => false,
        };

        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(RealtimeError::InvalidTopic(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// User that owns a per-user topic, `None` for shared topics
    pub fn owner(&self) -> Option<&str> {
        self.0
            .strip_prefix("user:")
            .and_then(|rest| rest.strip_suffix(":conversations"))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
