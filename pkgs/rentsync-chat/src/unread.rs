//! Unread status resolution
//!
//! Unread state comes from signals of decreasing freshness. Each tier is a
//! resolver returning `Some(unread)` when it can decide and `None` when it
//! has no signal; the first `Some` wins, and with no signal at all the
//! conversation is shown as read.

use chrono::{DateTime, Utc};
use rentsync_store::Message;

/// Everything the resolvers look at for one conversation
#[derive(Debug, Clone)]
pub struct UnreadInputs<'a> {
    pub viewer_id: &'a str,
    /// Server-side counter of the viewer
    pub unread_count: i64,
    pub last_message: Option<&'a Message>,
    /// Viewer's last-read marker
    pub last_read_at: Option<DateTime<Utc>>,
    /// Client-local flag, `None` when unset or unreadable
    pub local_hint: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadSource {
    Counter,
    ReadMarker,
    LocalHint,
    /// No tier had a signal
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadResolution {
    pub unread: bool,
    pub source: UnreadSource,
}

pub type UnreadResolver = fn(&UnreadInputs<'_>) -> Option<bool>;

/// Resolvers in priority order
pub const UNREAD_CASCADE: &[(UnreadSource, UnreadResolver)] = &[
    (UnreadSource::Counter, by_counter),
    (UnreadSource::ReadMarker, by_read_marker),
    (UnreadSource::LocalHint, by_local_hint),
];

/// A positive counter means unread; zero says nothing
pub fn by_counter(inputs: &UnreadInputs<'_>) -> Option<bool> {
    (inputs.unread_count > 0).then_some(true)
}

/// Compare the last message against the last-read marker
pub fn by_read_marker(inputs: &UnreadInputs<'_>) -> Option<bool> {
    match (inputs.last_message, inputs.last_read_at) {
        (None, _) => Some(false),
        (Some(message), _) if message.sender_id == inputs.viewer_id => Some(false),
        (Some(message), Some(read_at)) => Some(message.created_at > read_at),
        (Some(_), None) => None,
    }
}

pub fn by_local_hint(inputs: &UnreadInputs<'_>) -> Option<bool> {
    inputs.local_hint
}

pub fn resolve(inputs: &UnreadInputs<'_>) -> UnreadResolution {
    UNREAD_CASCADE
        .iter()
        .find_map(|(source, resolver)| {
            resolver(inputs).map(|unread| UnreadResolution {
                unread,
                source: *source,
            })
        })
        .unwrap_or(UnreadResolution {
            unread: false,
            source: UnreadSource::Fallback,
        })
}

/// True when only the local hint could still decide, so it is worth reading
pub fn needs_local_hint(inputs: &UnreadInputs<'_>) -> bool {
    UNREAD_CASCADE
        .iter()
        .filter(|(source, _)| *source != UnreadSource::LocalHint)
        .all(|(_, resolver)| resolver(inputs).is_none())
}
