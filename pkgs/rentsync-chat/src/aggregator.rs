//! Display-ready conversation list
//!
//! A refresh resolves the viewer's conversation ids, groups the per-participant
//! summary rows into one [`Conversation`] each, batch-resolves profiles, last
//! messages, bookings and read markers in parallel, and decides unread state
//! with the cascade in [`crate::unread`]. Only the most recently started
//! refresh may publish its result.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rentsync_store::{
    BookingRequest, DataStore, Message, Profile, ReadMarker, StoreError, SummaryRow, UnreadHints,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::diagnostics::FallbackDiagnostics;
use crate::fence::LatestOnly;
use crate::unread::{self, UnreadInputs, UnreadSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantSummary {
    pub id: String,
    pub display_name: Option<String>,
    pub email: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<ParticipantSummary>,
    pub booking_request: Option<BookingRequest>,
    pub last_message: Option<Message>,
    /// The viewer's own counter
    pub unread_count: u32,
    pub is_unread: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Participants other than `viewer_id`
    pub fn others<'a>(&'a self, viewer_id: &'a str) -> impl Iterator<Item = &'a ParticipantSummary> {
        self.participants.iter().filter(move |p| p.id != viewer_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationListState {
    pub conversations: Vec<Conversation>,
    pub loading: bool,
    pub error: Option<String>,
}

/// Summary rows of one conversation, before enrichment
struct Grouped {
    id: String,
    participants: Vec<ParticipantSummary>,
    viewer_unread: i64,
    last_message_id: Option<String>,
    booking_request_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn group_rows(viewer_id: &str, rows: Vec<SummaryRow>) -> Vec<Grouped> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Grouped> = HashMap::new();

    for row in rows {
        let group = groups.entry(row.conversation_id.clone()).or_insert_with(|| {
            order.push(row.conversation_id.clone());
            Grouped {
                id: row.conversation_id.clone(),
                participants: Vec::new(),
                viewer_unread: 0,
                last_message_id: row.last_message_id.clone(),
                booking_request_id: row.booking_request_id.clone(),
                created_at: row.created_at,
                updated_at: row.updated_at,
            }
        });

        if row.participant_id == viewer_id {
            group.viewer_unread = row.unread_count;
        }
        if !group.participants.iter().any(|p| p.id == row.participant_id) {
            group.participants.push(ParticipantSummary {
                id: row.participant_id,
                display_name: None,
                email: row.participant_email,
                last_seen_at: row.last_seen_at,
            });
        }
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .collect()
}

fn unique(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}

pub struct ConversationAggregator {
    store: Arc<dyn DataStore>,
    hints: Arc<dyn UnreadHints>,
    diagnostics: FallbackDiagnostics,
    state: Mutex<ConversationListState>,
    known_ids: Mutex<HashSet<String>>,
    refreshes: LatestOnly,
}

impl ConversationAggregator {
    pub fn new(
        store: Arc<dyn DataStore>,
        hints: Arc<dyn UnreadHints>,
        diagnostics: FallbackDiagnostics,
    ) -> Self {
        Self {
            store,
            hints,
            diagnostics,
            state: Mutex::new(ConversationListState::default()),
            known_ids: Mutex::new(HashSet::new()),
            refreshes: LatestOnly::default(),
        }
    }

    pub fn snapshot(&self) -> ConversationListState {
        self.state.lock().clone()
    }

    pub fn diagnostics(&self) -> &FallbackDiagnostics {
        &self.diagnostics
    }

    /// Ids from the last load plus ids learned from realtime events
    pub fn known_ids(&self) -> HashSet<String> {
        self.known_ids.lock().clone()
    }

    pub fn is_known(&self, conversation_id: &str) -> bool {
        self.known_ids.lock().contains(conversation_id)
    }

    /// Returns true when the id was new
    pub fn add_known(&self, conversation_id: &str) -> bool {
        self.known_ids.lock().insert(conversation_id.to_string())
    }

    pub fn clear(&self) {
        self.refreshes.begin();
        *self.state.lock() = ConversationListState::default();
        self.known_ids.lock().clear();
    }

    /// Reload the list for `viewer_id`. Returns false when a newer refresh
    /// started meanwhile and this result was discarded.
    #[instrument(skip(self))]
    pub async fn refresh(&self, viewer_id: &str) -> bool {
        let ticket = self.refreshes.begin();
        self.state.lock().loading = true;

        let result = self.load(viewer_id).await;
        if !self.refreshes.is_latest(ticket) {
            debug!("Discarding superseded conversation list");
            return false;
        }

        let mut state = self.state.lock();
        state.loading = false;
        match result {
            Ok(conversations) => {
                let ids: HashSet<String> = conversations.iter().map(|c| c.id.clone()).collect();
                self.diagnostics.retain_only(&ids);
                self.known_ids.lock().extend(ids);
                state.conversations = conversations;
                state.error = None;
            }
            Err(e) => {
                error!("Failed to load conversations: {}", e);
                state.error = Some(e.to_string());
            }
        }
        true
    }

    /// Build the list without publishing it
    pub async fn load(&self, viewer_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let conversation_ids = self.store.conversation_ids_for_user(viewer_id).await?;
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.store.conversation_summaries(&conversation_ids).await?;
        let grouped = group_rows(viewer_id, rows);

        let participant_ids = unique(
            grouped
                .iter()
                .flat_map(|g| g.participants.iter().map(|p| p.id.clone())),
        );
        let message_ids = unique(grouped.iter().filter_map(|g| g.last_message_id.clone()));
        let booking_ids = unique(grouped.iter().filter_map(|g| g.booking_request_id.clone()));

        let profiles = async {
            if participant_ids.is_empty() {
                Ok(Vec::new())
            } else {
                self.store.profiles(&participant_ids).await
            }
        };
        let messages = async {
            if message_ids.is_empty() {
                Ok(Vec::new())
            } else {
                self.store.messages_by_ids(&message_ids).await
            }
        };
        let bookings = async {
            if booking_ids.is_empty() {
                Ok(Vec::new())
            } else {
                self.store.booking_requests(&booking_ids).await
            }
        };
        let markers = self.store.read_markers(viewer_id, &conversation_ids);

        let (profiles, messages, bookings, markers): (
            Vec<Profile>,
            Vec<Message>,
            Vec<BookingRequest>,
            Vec<ReadMarker>,
        ) = futures::try_join!(profiles, messages, bookings, markers)?;

        let profiles: HashMap<String, Profile> =
            profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        let messages: HashMap<String, Message> =
            messages.into_iter().map(|m| (m.id.clone(), m)).collect();
        let bookings: HashMap<String, BookingRequest> =
            bookings.into_iter().map(|b| (b.id.clone(), b)).collect();
        let markers: HashMap<String, Option<DateTime<Utc>>> = markers
            .into_iter()
            .map(|m| (m.conversation_id, m.last_read_at))
            .collect();

        let mut conversations = Vec::with_capacity(grouped.len());
        for group in grouped {
            let participants = group
                .participants
                .into_iter()
                .map(|mut participant| {
                    if let Some(profile) = profiles.get(&participant.id) {
                        participant.display_name = Some(profile.display_name.clone());
                        if participant.email.is_empty() {
                            participant.email = profile.email.clone();
                        }
                        if participant.last_seen_at.is_none() {
                            participant.last_seen_at = profile.last_seen_at;
                        }
                    }
                    participant
                })
                .collect();

            let last_message = group
                .last_message_id
                .as_ref()
                .and_then(|id| messages.get(id))
                .cloned();
            let booking_request = group
                .booking_request_id
                .as_ref()
                .and_then(|id| bookings.get(id))
                .cloned();
            let last_read_at = markers.get(&group.id).copied().flatten();

            let is_unread = self
                .resolve_unread(
                    viewer_id,
                    &group.id,
                    group.viewer_unread,
                    last_message.as_ref(),
                    last_read_at,
                )
                .await;

            conversations.push(Conversation {
                id: group.id,
                participants,
                booking_request,
                last_message,
                unread_count: u32::try_from(group.viewer_unread.max(0)).unwrap_or(u32::MAX),
                is_unread,
                last_read_at,
                created_at: group.created_at,
                updated_at: group.updated_at,
            });
        }

        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn resolve_unread(
        &self,
        viewer_id: &str,
        conversation_id: &str,
        unread_count: i64,
        last_message: Option<&Message>,
        last_read_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inputs = UnreadInputs {
            viewer_id,
            unread_count,
            last_message,
            last_read_at,
            local_hint: None,
        };

        if unread::needs_local_hint(&inputs) {
            inputs.local_hint = match self.hints.get(viewer_id, conversation_id).await {
                Ok(hint) => hint,
                Err(e) => {
                    debug!("Local unread hint unavailable for {}: {}", conversation_id, e);
                    None
                }
            };
        }

        let resolution = unread::resolve(&inputs);
        if resolution.source == UnreadSource::Fallback {
            self.diagnostics.report(viewer_id, conversation_id);
        }
        resolution.unread
    }
}
