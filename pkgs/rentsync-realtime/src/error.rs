//! Error types for realtime operations

use thiserror::Error;

/// Errors that can occur on the pub/sub transport
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Transport shut down")]
    TransportClosed,
    #[error("Subscription to {topic} refused: {reason}")]
    SubscribeRefused { topic: String, reason: String },
    #[error("Presence key missing for {0}")]
    PresenceKeyMissing(String),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Broadcast on {topic} not accepted: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Rejected payload for '{event}': {reason}")]
    PayloadRejected { event: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
