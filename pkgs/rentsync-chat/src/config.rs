use rentsync_realtime::{GossipConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SILENCE_WINDOW};
use std::time::Duration;

/// Timing and cache settings for a chat session
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Presence re-announce period
    pub heartbeat_interval: Duration,
    /// Typing clears after this much silence
    pub typing_silence_window: Duration,
    /// How long an unread-fallback diagnostic stays deduplicated
    pub diagnostics_ttl: Duration,
    /// Maximum number of conversation ids remembered by the diagnostics cache
    pub diagnostics_capacity: usize,
    /// Remote presences expire after this long without a heartbeat
    pub presence_ttl: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            typing_silence_window: DEFAULT_SILENCE_WINDOW,
            diagnostics_ttl: Duration::from_secs(5 * 60),
            diagnostics_capacity: 1024,
            presence_ttl: DEFAULT_HEARTBEAT_INTERVAL * 3,
        }
    }
}

impl ChatConfig {
    /// Gossip transport settings matching this session's presence timing
    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            presence_ttl: self.presence_ttl,
            ..GossipConfig::default()
        }
    }
}
