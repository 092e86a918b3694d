//! Shared helpers for the chat integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rentsync_store::{
    BookingRequest, DataStore, Message, MessageKind, NewMessage, Profile, ReadMarker,
    SqliteStore, StoreError, SummaryRow,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub async fn memory_store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:")
        .await
        .expect("Failed to create store")
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn text(conversation_id: &str, sender_id: &str, content: &str) -> NewMessage {
    NewMessage {
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        kind: MessageKind::Text,
    }
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// DataStore wrapper that can delay history, fail calls, zero counters and
/// records which batch lookups were made
pub struct ScriptedStore {
    pub inner: SqliteStore,
    history_delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<&'static str>>,
    pub fail_history: AtomicBool,
    pub fail_mark_read: AtomicBool,
    pub fail_summaries: AtomicBool,
    pub zero_counters: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            history_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_history: AtomicBool::new(false),
            fail_mark_read: AtomicBool::new(false),
            fail_summaries: AtomicBool::new(false),
            zero_counters: AtomicBool::new(false),
        }
    }

    pub fn delay_history(&self, conversation_id: &str, delay: Duration) {
        self.history_delays
            .lock()
            .insert(conversation_id.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl DataStore for ScriptedStore {
    async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.record("conversation_ids_for_user");
        self.inner.conversation_ids_for_user(user_id).await
    }

    async fn conversation_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.conversation_participants(conversation_id).await
    }

    async fn conversation_summaries(
        &self,
        conversation_ids: &[String],
    ) -> Result<Vec<SummaryRow>, StoreError> {
        self.record("conversation_summaries");
        if self.fail_summaries.load(Ordering::SeqCst) {
            return Err(StoreError::LocalStorage("summaries unavailable".into()));
        }
        let mut rows = self.inner.conversation_summaries(conversation_ids).await?;
        if self.zero_counters.load(Ordering::SeqCst) {
            for row in &mut rows {
                row.unread_count = 0;
            }
        }
        Ok(rows)
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, StoreError> {
        self.record("profiles");
        self.inner.profiles(user_ids).await
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let delay = self.history_delays.lock().get(conversation_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::LocalStorage("history unavailable".into()));
        }
        self.inner.messages_for_conversation(conversation_id).await
    }

    async fn messages_by_ids(&self, message_ids: &[String]) -> Result<Vec<Message>, StoreError> {
        self.record("messages_by_ids");
        self.inner.messages_by_ids(message_ids).await
    }

    async fn booking_requests(&self, ids: &[String]) -> Result<Vec<BookingRequest>, StoreError> {
        self.record("booking_requests");
        self.inner.booking_requests(ids).await
    }

    async fn read_markers(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<Vec<ReadMarker>, StoreError> {
        self.record("read_markers");
        self.inner.read_markers(user_id, conversation_ids).await
    }

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.record("mark_read");
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(StoreError::LocalStorage("mark_read unavailable".into()));
        }
        self.inner.mark_read(conversation_id, user_id).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.inner.insert_message(message).await
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.touch_conversation(conversation_id, updated_at).await
    }

    async fn find_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        self.inner
            .find_conversation(participant_ids, booking_request_id)
            .await
    }

    async fn create_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<String, StoreError> {
        self.inner
            .create_conversation(participant_ids, booking_request_id)
            .await
    }
}
