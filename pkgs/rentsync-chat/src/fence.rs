//! Fencing of async results against newer work
//!
//! [`ActiveCell`] holds the conversation the user is looking at. Activating
//! a conversation hands out a [`FenceToken`]; a continuation that resumes
//! after an await must check its token before touching shared state.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceToken {
    generation: u64,
    conversation_id: String,
}

impl FenceToken {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

#[derive(Default)]
struct ActiveState {
    generation: u64,
    conversation_id: Option<String>,
}

#[derive(Default)]
pub struct ActiveCell {
    state: Mutex<ActiveState>,
}

impl ActiveCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conversation_id` active, invalidating every earlier token
    pub fn activate(&self, conversation_id: &str) -> FenceToken {
        let mut state = self.state.lock();
        state.generation += 1;
        state.conversation_id = Some(conversation_id.to_string());
        FenceToken {
            generation: state.generation,
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.conversation_id = None;
    }

    pub fn is_current(&self, token: &FenceToken) -> bool {
        self.state.lock().generation == token.generation
    }

    /// Token for the current activation, if it is `conversation_id`
    pub fn token_for(&self, conversation_id: &str) -> Option<FenceToken> {
        let state = self.state.lock();
        match state.conversation_id.as_deref() {
            Some(active) if active == conversation_id => Some(FenceToken {
                generation: state.generation,
                conversation_id: active.to_string(),
            }),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<String> {
        self.state.lock().conversation_id.clone()
    }

    pub fn matches(&self, conversation_id: &str) -> bool {
        self.state.lock().conversation_id.as_deref() == Some(conversation_id)
    }
}

/// Lets only the most recently started operation publish its result
#[derive(Default)]
pub struct LatestOnly {
    started: AtomicU64,
}

impl LatestOnly {
    pub fn begin(&self) -> u64 {
        self.started.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_latest(&self, ticket: u64) -> bool {
        self.started.load(Ordering::Acquire) == ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_activation_invalidates_token() {
        let cell = ActiveCell::new();
        let first = cell.activate("conv-1");
        assert!(cell.is_current(&first));

        let second = cell.activate("conv-2");
        assert!(!cell.is_current(&first));
        assert!(cell.is_current(&second));
        assert_eq!(second.conversation_id(), "conv-2");
    }

    #[test]
    fn test_reactivating_same_conversation_still_fences() {
        let cell = ActiveCell::new();
        let first = cell.activate("conv-1");
        let again = cell.activate("conv-1");
        assert!(!cell.is_current(&first));
        assert_eq!(cell.token_for("conv-1"), Some(again));
        assert_eq!(cell.token_for("conv-2"), None);

        cell.clear();
        assert_eq!(cell.current(), None);
        assert!(!cell.matches("conv-1"));
    }

    #[test]
    fn test_latest_only() {
        let fence = LatestOnly::default();
        let first = fence.begin();
        let second = fence.begin();
        assert!(!fence.is_latest(first));
        assert!(fence.is_latest(second));
    }
}
