//! History and sending for the conversation on screen
//!
//! Every continuation of [`MessageStreamController::fetch_messages`] checks
//! its fence token when its await resolves, so a slow response for a
//! conversation the user already left can never overwrite the visible list.
//! Messages from the send path and the realtime path both go through
//! [`MessageStreamController::append_if_absent`], which dedupes by id.

use parking_lot::Mutex;
use rentsync_realtime::MessageCreated;
use rentsync_store::{DataStore, Message, MessageKind, NewMessage, StoreError};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::error::ChatError;
use crate::fence::{ActiveCell, FenceToken};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListState {
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// History published; carries the number of messages
    Loaded(usize),
    /// The user moved on before the history arrived
    Stale,
    /// History could not be loaded; the reason is in the list state
    Failed,
}

pub struct MessageStreamController {
    store: Arc<dyn DataStore>,
    viewer_id: String,
    active: ActiveCell,
    state: Mutex<MessageListState>,
    list_refresh: Arc<Notify>,
}

impl MessageStreamController {
    /// `list_refresh` is notified whenever the conversation list should reload
    pub fn new(store: Arc<dyn DataStore>, viewer_id: &str, list_refresh: Arc<Notify>) -> Self {
        Self {
            store,
            viewer_id: viewer_id.to_string(),
            active: ActiveCell::new(),
            state: Mutex::new(MessageListState::default()),
            list_refresh,
        }
    }

    pub fn snapshot(&self) -> MessageListState {
        self.state.lock().clone()
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.active.current()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.matches(conversation_id)
    }

    /// Load the history of `conversation_id`, publish it and mark it read
    pub async fn fetch_messages(&self, conversation_id: &str) -> Result<FetchOutcome, ChatError> {
        let token = self.activate(conversation_id);
        self.load(token).await
    }

    /// Make `conversation_id` the visible conversation without loading it yet
    pub fn activate(&self, conversation_id: &str) -> FenceToken {
        let token = self.active.activate(conversation_id);
        let mut state = self.state.lock();
        if state.conversation_id.as_deref() != Some(conversation_id) {
            state.conversation_id = Some(conversation_id.to_string());
            state.messages.clear();
        }
        state.loading = true;
        state.error = None;
        token
    }

    pub fn is_current(&self, token: &FenceToken) -> bool {
        self.active.is_current(token)
    }

    /// Fetch and publish the history for an activation, then mark it read
    #[instrument(skip(self, token), fields(conversation_id = token.conversation_id()))]
    pub async fn load(&self, token: FenceToken) -> Result<FetchOutcome, ChatError> {
        let conversation_id = token.conversation_id();
        if !self.active.is_current(&token) {
            return Ok(FetchOutcome::Stale);
        }

        let result = self.store.messages_for_conversation(conversation_id).await;
        if !self.active.is_current(&token) {
            debug!("Discarding stale history for {}", conversation_id);
            return Ok(FetchOutcome::Stale);
        }

        let history = match result {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load history for {}: {}", conversation_id, e);
                let mut state = self.state.lock();
                state.loading = false;
                state.error = Some(e.to_string());
                return Ok(FetchOutcome::Failed);
            }
        };

        let count = {
            let mut state = self.state.lock();
            let mut merged = history;
            for message in state.messages.drain(..) {
                if !merged.iter().any(|m| m.id == message.id) {
                    merged.push(message);
                }
            }
            merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            state.messages = merged;
            state.loading = false;
            state.messages.len()
        };

        let marked = self.store.mark_read(conversation_id, &self.viewer_id).await;
        if !self.active.is_current(&token) {
            debug!("Conversation switched during mark-read of {}", conversation_id);
            return Ok(FetchOutcome::Loaded(count));
        }
        match marked {
            Ok(()) => self.list_refresh.notify_one(),
            Err(e) => warn!("Failed to mark {} read: {}", conversation_id, e),
        }

        Ok(FetchOutcome::Loaded(count))
    }

    /// Insert a message and show it immediately; the conversation touch and
    /// list refresh run in the background
    #[instrument(skip(self, content))]
    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, ChatError> {
        let new_message = NewMessage {
            conversation_id: conversation_id.to_string(),
            sender_id: self.viewer_id.clone(),
            content: content.to_string(),
            kind,
        };
        if let Err(e) = new_message.validate() {
            return Err(match e {
                StoreError::Validation(reason) => ChatError::InvalidMessage(reason),
                other => other.into(),
            });
        }

        let message = match self.store.insert_message(new_message).await {
            Ok(message) => message,
            Err(e) => {
                if self.active.matches(conversation_id) {
                    self.state.lock().error = Some(e.to_string());
                }
                return Err(e.into());
            }
        };

        self.append_if_absent(&message);

        let store = self.store.clone();
        let list_refresh = self.list_refresh.clone();
        let touched_id = message.conversation_id.clone();
        let touched_at = message.created_at;
        tokio::spawn(async move {
            if let Err(e) = store.touch_conversation(&touched_id, touched_at).await {
                warn!("Failed to touch conversation {}: {}", touched_id, e);
            }
            list_refresh.notify_one();
        });

        Ok(message)
    }

    /// Add `message` to the visible list unless it is already there or
    /// belongs to another conversation
    pub fn append_if_absent(&self, message: &Message) -> bool {
        if !self.active.matches(&message.conversation_id) {
            return false;
        }

        let mut state = self.state.lock();
        if state.conversation_id.as_deref() != Some(message.conversation_id.as_str())
            || state.messages.iter().any(|m| m.id == message.id)
        {
            return false;
        }

        let position = state
            .messages
            .iter()
            .rposition(|m| m.created_at <= message.created_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        state.messages.insert(position, message.clone());
        true
    }

    /// Handle a realtime "message created" signal for the open conversation
    pub async fn on_message_created(&self, event: &MessageCreated) -> Result<bool, ChatError> {
        let Some(token) = self.active.token_for(&event.conversation_id) else {
            return Ok(false);
        };
        if self
            .state
            .lock()
            .messages
            .iter()
            .any(|m| m.id == event.message_id)
        {
            return Ok(false);
        }

        let fetched = self
            .store
            .messages_by_ids(std::slice::from_ref(&event.message_id))
            .await?;
        if !self.active.is_current(&token) {
            debug!("Dropping realtime message for inactive {}", event.conversation_id);
            return Ok(false);
        }

        let mut appended = false;
        for message in &fetched {
            appended |= self.append_if_absent(message);
        }
        Ok(appended)
    }

    /// Forget the active conversation and its messages
    pub fn reset(&self) {
        self.active.clear();
        *self.state.lock() = MessageListState::default();
    }
}
