//! Records exchanged with the data store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Upper bound on message content, in characters
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Message type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
    Booking,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
            MessageKind::Booking => "booking",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "system" => Ok(MessageKind::System),
            "booking" => Ok(MessageKind::Booking),
            other => Err(StoreError::InvalidValue {
                field: "message.kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Stored message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// Message about to be inserted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
}

impl NewMessage {
    /// Reject empty and oversized content before it reaches the store
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.content.trim().is_empty() {
            return Err(StoreError::Validation("message content is empty".into()));
        }
        let length = self.content.chars().count();
        if length > MAX_MESSAGE_LENGTH {
            return Err(StoreError::Validation(format!(
                "message content is {} characters, maximum is {}",
                length, MAX_MESSAGE_LENGTH
            )));
        }
        Ok(())
    }
}

/// User profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Booking lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Approved,
    Declined,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Declined => "declined",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "declined" => Ok(BookingStatus::Declined),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(StoreError::InvalidValue {
                field: "booking_request.status",
                value: other.to_string(),
            }),
        }
    }
}

/// Rental transaction a conversation may be attached to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: String,
    pub equipment_title: String,
    pub status: BookingStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// Denormalized summary row, one per (conversation, participant)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryRow {
    pub conversation_id: String,
    pub participant_id: String,
    pub participant_email: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<String>,
    pub booking_request_id: Option<String>,
    /// Unread counter of `participant_id`, not of the viewer
    pub unread_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user last-read marker for a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadMarker {
    pub conversation_id: String,
    pub user_id: String,
    pub last_read_at: Option<DateTime<Utc>>,
}
