//! Typing indicators
//!
//! [`TypingBroadcaster`] is the sending side: it announces "is typing" while
//! the user edits, clears after a silence window, and clears immediately when
//! a message is sent. [`TypingRoster`] is the receiving side: the set of
//! users currently typing in the open conversation.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::channel_manager::ChannelManager;
use crate::events::TypingSignal;

pub const DEFAULT_SILENCE_WINDOW: Duration = Duration::from_secs(3);

#[derive(Default)]
struct BroadcastState {
    conversation_id: Option<String>,
    typing: bool,
    last_announce: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

pub struct TypingBroadcaster {
    manager: Arc<ChannelManager>,
    user_id: String,
    silence_window: Duration,
    state: Arc<Mutex<BroadcastState>>,
}

impl TypingBroadcaster {
    pub fn new(manager: Arc<ChannelManager>, user_id: &str, silence_window: Duration) -> Self {
        Self {
            manager,
            user_id: user_id.to_string(),
            silence_window,
            state: Arc::new(Mutex::new(BroadcastState::default())),
        }
    }

    pub fn is_typing(&self) -> bool {
        self.state.lock().typing
    }

    /// Record an edit of the composer for `conversation_id`
    pub async fn notify_typing(&self, conversation_id: &str, content: &str) {
        if content.trim().is_empty() {
            self.stop_typing(conversation_id).await;
            return;
        }

        let now = Instant::now();
        let (left_behind, announce) = {
            let mut state = self.state.lock();
            let mut left_behind = None;
            if state.conversation_id.as_deref() != Some(conversation_id) {
                if state.typing {
                    left_behind = state.conversation_id.take();
                }
                state.conversation_id = Some(conversation_id.to_string());
                state.typing = false;
                state.last_announce = None;
            }

            let announce = !state.typing
                || state
                    .last_announce
                    .map(|at| now.duration_since(at) >= self.silence_window / 2)
                    .unwrap_or(true);
            state.typing = true;
            if announce {
                state.last_announce = Some(now);
            }

            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timer = Some(tokio::spawn(clear_after(
                self.manager.clone(),
                self.state.clone(),
                self.user_id.clone(),
                conversation_id.to_string(),
                state.generation,
                self.silence_window,
            )));
            (left_behind, announce)
        };

        if let Some(previous) = left_behind {
            broadcast(&self.manager, &self.user_id, &previous, false).await;
        }
        if announce {
            broadcast(&self.manager, &self.user_id, conversation_id, true).await;
        }
    }

    /// Broadcast "not typing" now, unless the silence timer already did
    pub async fn stop_typing(&self, conversation_id: &str) {
        let clear = {
            let mut state = self.state.lock();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if state.typing && state.conversation_id.as_deref() == Some(conversation_id) {
                state.typing = false;
                state.last_announce = None;
                true
            } else {
                false
            }
        };

        if clear {
            broadcast(&self.manager, &self.user_id, conversation_id, false).await;
        }
    }

    /// Forget all state without broadcasting
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let generation = state.generation + 1;
        *state = BroadcastState {
            generation,
            ..BroadcastState::default()
        };
    }
}

impl Drop for TypingBroadcaster {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}

async fn clear_after(
    manager: Arc<ChannelManager>,
    state: Arc<Mutex<BroadcastState>>,
    user_id: String,
    conversation_id: String,
    generation: u64,
    window: Duration,
) {
    tokio::time::sleep(window).await;

    let clear = {
        let mut state = state.lock();
        if state.generation == generation && state.typing {
            state.typing = false;
            state.last_announce = None;
            state.timer = None;
            true
        } else {
            false
        }
    };

    if clear {
        debug!("Typing went silent in {}", conversation_id);
        broadcast(&manager, &user_id, &conversation_id, false).await;
    }
}

async fn broadcast(manager: &ChannelManager, user_id: &str, conversation_id: &str, is_typing: bool) {
    let signal = TypingSignal {
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        is_typing,
        at: Utc::now(),
    };
    if let Err(e) = manager.send_typing(&signal).await {
        debug!("Typing signal not sent: {}", e);
    }
}

/// Users typing in the open conversation, as seen by the receiver
pub struct TypingRoster {
    self_id: String,
    window: Duration,
    conversation_id: Option<String>,
    typists: HashMap<String, Instant>,
}

impl TypingRoster {
    pub fn new(self_id: &str, window: Duration) -> Self {
        Self {
            self_id: self_id.to_string(),
            window,
            conversation_id: None,
            typists: HashMap::new(),
        }
    }

    /// Switch to another conversation; the roster starts empty
    pub fn set_conversation(&mut self, conversation_id: Option<&str>) {
        if self.conversation_id.as_deref() != conversation_id {
            self.conversation_id = conversation_id.map(str::to_string);
            self.typists.clear();
        }
    }

    /// Apply a signal; returns true when the roster changed
    pub fn apply(&mut self, signal: &TypingSignal, now: Instant) -> bool {
        if signal.user_id == self.self_id
            || self.conversation_id.as_deref() != Some(signal.conversation_id.as_str())
        {
            return false;
        }

        if signal.is_typing {
            self.typists.insert(signal.user_id.clone(), now).is_none()
        } else {
            self.typists.remove(&signal.user_id).is_some()
        }
    }

    /// Drop entries older than the silence window; returns true when any expired
    pub fn prune(&mut self, now: Instant) -> bool {
        let window = self.window;
        let before = self.typists.len();
        self.typists
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        self.typists.len() != before
    }

    pub fn users(&mut self, now: Instant) -> Vec<String> {
        self.prune(now);
        let mut users: Vec<String> = self.typists.keys().cloned().collect();
        users.sort();
        users
    }
}
