//! Data-store interface consumed by the realtime core
//!
//! The backing store is treated as an opaque relational query service. Every
//! batch lookup takes a slice of ids and returns whatever rows exist; callers
//! are expected to skip the call entirely when they have no ids to resolve.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{BookingRequest, Message, NewMessage, Profile, ReadMarker, SummaryRow};

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Ids of every conversation `user_id` participates in
    async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// User ids participating in a conversation, in join order
    async fn conversation_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Denormalized summary rows, one per participant per conversation
    async fn conversation_summaries(
        &self,
        conversation_ids: &[String],
    ) -> Result<Vec<SummaryRow>, StoreError>;

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, StoreError>;

    /// Full history of a conversation, ordered by created-at ascending
    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError>;

    async fn messages_by_ids(&self, message_ids: &[String]) -> Result<Vec<Message>, StoreError>;

    async fn booking_requests(&self, ids: &[String]) -> Result<Vec<BookingRequest>, StoreError>;

    /// Last-read markers of `user_id` for the given conversations
    async fn read_markers(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<Vec<ReadMarker>, StoreError>;

    /// Reset the unread counter of `user_id` and stamp its last-read marker
    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Find a conversation with exactly these participants (and booking, when given)
    async fn find_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<Option<String>, StoreError>;

    async fn create_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<String, StoreError>;
}
