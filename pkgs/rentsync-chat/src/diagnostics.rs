//! Deduplicated diagnostics for unread fallbacks
//!
//! When no unread tier has a signal the conversation is shown as read and a
//! diagnostic is emitted. [`FallbackDiagnostics`] remembers which
//! conversations were already reported, each for a limited time, so a
//! conversation stuck in that state is reported once per TTL rather than on
//! every list refresh.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub struct FallbackDiagnostics {
    ttl: Duration,
    capacity: usize,
    /// conversation id -> expiry
    entries: Mutex<HashMap<String, Instant>>,
    reported: AtomicU64,
}

impl FallbackDiagnostics {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            reported: AtomicU64::new(0),
        }
    }

    /// Record `conversation_id`; true when it was not already reported within the TTL
    pub fn should_report(&self, conversation_id: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        entries.retain(|_, expiry| *expiry > now);

        if entries.contains_key(conversation_id) {
            return false;
        }

        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, expiry)| **expiry)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(conversation_id.to_string(), now + self.ttl);
        true
    }

    /// Emit the fallback diagnostic unless it was emitted recently
    pub fn report(&self, viewer_id: &str, conversation_id: &str) -> bool {
        if !self.should_report(conversation_id, Instant::now()) {
            return false;
        }
        self.reported.fetch_add(1, Ordering::Relaxed);
        warn!(
            viewer_id,
            conversation_id, "No unread signal available, showing conversation as read"
        );
        true
    }

    /// Forget ids that are no longer in the conversation list
    pub fn retain_only(&self, live_ids: &HashSet<String>) {
        self.entries.lock().retain(|id, _| live_ids.contains(id));
    }

    /// Number of diagnostics emitted so far
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_ttl() {
        let diagnostics = FallbackDiagnostics::new(Duration::from_secs(300), 16);
        let now = Instant::now();

        assert!(diagnostics.should_report("conv-1", now));
        assert!(!diagnostics.should_report("conv-1", now + Duration::from_secs(299)));
        assert!(diagnostics.should_report("conv-1", now + Duration::from_secs(300)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let diagnostics = FallbackDiagnostics::new(Duration::from_secs(300), 2);
        let now = Instant::now();

        assert!(diagnostics.should_report("conv-1", now));
        assert!(diagnostics.should_report("conv-2", now + Duration::from_secs(1)));
        assert!(diagnostics.should_report("conv-3", now + Duration::from_secs(2)));
        assert_eq!(diagnostics.len(), 2);

        assert!(diagnostics.should_report("conv-1", now + Duration::from_secs(3)));
        assert!(!diagnostics.should_report("conv-3", now + Duration::from_secs(3)));
    }

    #[test]
    fn test_retain_only_drops_vanished_ids() {
        let diagnostics = FallbackDiagnostics::new(Duration::from_secs(300), 16);
        let now = Instant::now();
        diagnostics.should_report("conv-1", now);
        diagnostics.should_report("conv-2", now);

        let live: HashSet<String> = ["conv-2".to_string()].into_iter().collect();
        diagnostics.retain_only(&live);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics.should_report("conv-1", now));
    }

    #[tokio::test]
    async fn test_report_counts_emitted_diagnostics() {
        let diagnostics = FallbackDiagnostics::new(Duration::from_secs(300), 16);
        assert!(diagnostics.report("bob", "conv-1"));
        assert!(!diagnostics.report("bob", "conv-1"));
        assert_eq!(diagnostics.reported(), 1);
    }
}
