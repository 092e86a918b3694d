//! Session facade for the presentation layer
//!
//! A [`ChatSession`] wires the aggregator, the message stream controller, the
//! channel manager, presence and typing together for one logged-in user and
//! reports changes as [`ChatEvent`]s.

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use rentsync_realtime::{
    ChannelManager, ChannelStatus, ManagerEvent, MessageCreated, ParticipantAdded, PresenceTracker,
    PresenceUpdate, RealtimeEvent, Scope, Topic, Transport, TypingBroadcaster, TypingRoster,
};
use rentsync_store::{DataStore, Message, MessageKind, UnreadHints};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::aggregator::{ConversationAggregator, ConversationListState};
use crate::config::ChatConfig;
use crate::controller::{FetchOutcome, MessageListState, MessageStreamController};
use crate::diagnostics::FallbackDiagnostics;
use crate::error::ChatError;

/// Change notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ConversationsUpdated,
    MessagesUpdated { conversation_id: String },
    TypingChanged { conversation_id: String, users: Vec<String> },
    PresenceChanged { online: Vec<String> },
    ChannelError { topic: String, reason: String },
}

struct SessionInner {
    user_id: String,
    store: Arc<dyn DataStore>,
    hints: Arc<dyn UnreadHints>,
    channels: Arc<ChannelManager>,
    presence: PresenceTracker,
    typing: TypingBroadcaster,
    roster: Mutex<TypingRoster>,
    aggregator: ConversationAggregator,
    controller: MessageStreamController,
    list_refresh: Arc<Notify>,
    switch_lock: AsyncMutex<()>,
    events: mpsc::UnboundedSender<ChatEvent>,
    closed: AtomicBool,
}

impl SessionInner {
    fn emit(&self, event: ChatEvent) {
        let _ = self.events.unbounded_send(event);
    }

    fn ensure_open(&self) -> Result<(), ChatError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChatError::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn set_hint(&self, conversation_id: &str, unread: bool) {
        if let Err(e) = self.hints.set(&self.user_id, conversation_id, unread).await {
            debug!("Failed to store unread hint for {}: {}", conversation_id, e);
        }
    }

    async fn refresh_list(&self) {
        if self.aggregator.refresh(&self.user_id).await {
            self.emit(ChatEvent::ConversationsUpdated);
        }
    }

    async fn handle_manager_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::Realtime {
                scope: Scope::Conversation(_),
                event: RealtimeEvent::MessageCreated(created),
            } => {
                match self.controller.on_message_created(&created).await {
                    Ok(true) => self.emit(ChatEvent::MessagesUpdated {
                        conversation_id: created.conversation_id.clone(),
                    }),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to load realtime message {}: {}", created.message_id, e),
                }
                self.list_refresh.notify_one();
            }
            ManagerEvent::Realtime {
                scope: Scope::Conversation(_),
                event: RealtimeEvent::Typing(signal),
            } => {
                let users = {
                    let mut roster = self.roster.lock();
                    let now = Instant::now();
                    roster.apply(&signal, now).then(|| roster.users(now))
                };
                if let Some(users) = users {
                    self.emit(ChatEvent::TypingChanged {
                        conversation_id: signal.conversation_id,
                        users,
                    });
                }
            }
            ManagerEvent::Realtime {
                scope: Scope::User(_),
                event: RealtimeEvent::ParticipantAdded(added),
            } => {
                if added.user_id != self.user_id {
                    warn!("Ignoring participant_added for {} on our channel", added.user_id);
                    return;
                }
                if self.aggregator.add_known(&added.conversation_id) {
                    info!("Added to conversation {}", added.conversation_id);
                }
                self.list_refresh.notify_one();
            }
            ManagerEvent::Realtime {
                scope: Scope::User(_),
                event: RealtimeEvent::MessageCreated(created),
            } => {
                if self.controller.is_active(&created.conversation_id) {
                    return;
                }
                if created.sender_id != self.user_id {
                    self.set_hint(&created.conversation_id, true).await;
                }
                self.list_refresh.notify_one();
            }
            ManagerEvent::Realtime { scope, event } => {
                debug!("Ignoring {} on {:?}", event.event_name(), scope);
            }
            ManagerEvent::Status { topic, status, .. } => {
                if let ChannelStatus::Errored(reason) = &status {
                    self.emit(ChatEvent::ChannelError {
                        topic: topic.to_string(),
                        reason: reason.clone(),
                    });
                } else if status.is_failure() {
                    self.emit(ChatEvent::ChannelError {
                        topic: topic.to_string(),
                        reason: "timed out".to_string(),
                    });
                }
            }
        }
    }
}

pub struct ChatSession {
    inner: Arc<SessionInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    /// Log `user_id` in: open the user channel, join presence, load the
    /// conversation list and start the background tasks
    #[instrument(skip(store, hints, transport, config))]
    pub async fn start(
        user_id: &str,
        store: Arc<dyn DataStore>,
        hints: Arc<dyn UnreadHints>,
        transport: Arc<dyn Transport>,
        config: ChatConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChatEvent>), ChatError> {
        let (events, receiver) = mpsc::unbounded();
        let (channels, manager_events) = ChannelManager::new(transport.clone());
        let channels = Arc::new(channels);
        let (presence, presence_updates) =
            PresenceTracker::new(transport, config.heartbeat_interval);
        let list_refresh = Arc::new(Notify::new());

        let inner = Arc::new(SessionInner {
            user_id: user_id.to_string(),
            store: store.clone(),
            hints: hints.clone(),
            channels: channels.clone(),
            presence,
            typing: TypingBroadcaster::new(channels, user_id, config.typing_silence_window),
            roster: Mutex::new(TypingRoster::new(user_id, config.typing_silence_window)),
            aggregator: ConversationAggregator::new(
                store.clone(),
                hints,
                FallbackDiagnostics::new(config.diagnostics_ttl, config.diagnostics_capacity),
            ),
            controller: MessageStreamController::new(store, user_id, list_refresh.clone()),
            list_refresh,
            switch_lock: AsyncMutex::new(()),
            events,
            closed: AtomicBool::new(false),
        });

        let session = Self {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };
        session.spawn_tasks(manager_events, presence_updates, config);

        if let Err(e) = inner.channels.open_user(user_id).await {
            warn!("Failed to open user channel: {}", e);
        }
        if let Err(e) = inner.presence.start(user_id).await {
            warn!("Failed to join presence: {}", e);
        }
        inner.refresh_list().await;

        info!("Chat session started for {}", user_id);
        Ok((session, receiver))
    }

    fn spawn_tasks(
        &self,
        mut manager_events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut presence_updates: mpsc::UnboundedReceiver<PresenceUpdate>,
        config: ChatConfig,
    ) {
        let mut tasks = self.tasks.lock();

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = manager_events.next().await {
                inner.handle_manager_event(event).await;
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(update) = presence_updates.next().await {
                inner.emit(ChatEvent::PresenceChanged {
                    online: update.online,
                });
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                inner.list_refresh.notified().await;
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.refresh_list().await;
            }
        }));

        let inner = self.inner.clone();
        let period = (config.typing_silence_window / 2).max(std::time::Duration::from_millis(100));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = {
                    let mut roster = inner.roster.lock();
                    let now = Instant::now();
                    roster.prune(now).then(|| roster.users(now))
                };
                if let (Some(users), Some(conversation_id)) =
                    (expired, inner.controller.active_conversation())
                {
                    inner.emit(ChatEvent::TypingChanged {
                        conversation_id,
                        users,
                    });
                }
            }
        }));
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn conversations(&self) -> ConversationListState {
        self.inner.aggregator.snapshot()
    }

    pub fn messages(&self) -> MessageListState {
        self.inner.controller.snapshot()
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.inner.controller.active_conversation()
    }

    /// Ids of conversations this session knows about
    pub fn known_conversations(&self) -> HashSet<String> {
        self.inner.aggregator.known_ids()
    }

    pub async fn refresh_conversations(&self) -> Result<(), ChatError> {
        self.inner.ensure_open()?;
        self.inner.refresh_list().await;
        Ok(())
    }

    /// Open `conversation_id`: switch the realtime scope, load its history
    /// and mark it read. A history that cannot be loaded is reported through
    /// the list state's `error`, with [`FetchOutcome::Failed`].
    #[instrument(skip(self))]
    pub async fn fetch_messages(&self, conversation_id: &str) -> Result<FetchOutcome, ChatError> {
        self.inner.ensure_open()?;
        let inner = &self.inner;

        let previous = inner.controller.active_conversation();
        let token = inner.controller.activate(conversation_id);
        if let Some(previous) = previous.filter(|p| p != conversation_id) {
            inner.typing.stop_typing(&previous).await;
        }
        let cleared = {
            let mut roster = inner.roster.lock();
            let had_typists = !roster.users(Instant::now()).is_empty();
            roster.set_conversation(Some(conversation_id));
            had_typists
        };
        if cleared {
            inner.emit(ChatEvent::TypingChanged {
                conversation_id: conversation_id.to_string(),
                users: Vec::new(),
            });
        }

        {
            let _switching = inner.switch_lock.lock().await;
            if !inner.controller.is_current(&token) {
                return Ok(FetchOutcome::Stale);
            }
            if let Err(e) = inner.channels.open_conversation(conversation_id).await {
                warn!("Failed to open realtime scope for {}: {}", conversation_id, e);
            }
        }

        inner.set_hint(conversation_id, false).await;
        let outcome = inner.controller.load(token).await?;
        if matches!(outcome, FetchOutcome::Loaded(_) | FetchOutcome::Failed) {
            inner.emit(ChatEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Send a text message to `conversation_id`
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, ChatError> {
        self.send_message_with_kind(conversation_id, content, MessageKind::Text)
            .await
    }

    #[instrument(skip(self, content))]
    pub async fn send_message_with_kind(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, ChatError> {
        self.inner.ensure_open()?;
        let inner = &self.inner;

        inner.typing.stop_typing(conversation_id).await;
        let message = inner.controller.send(conversation_id, content, kind).await?;
        if inner.controller.is_active(conversation_id) {
            inner.emit(ChatEvent::MessagesUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }

        let announcer = inner.clone();
        let created = MessageCreated {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
        };
        tokio::spawn(async move {
            announcer.announce_message(created).await;
        });

        Ok(message)
    }

    /// Find the conversation between exactly these participants (for this
    /// booking, when given) or create it and notify every participant
    #[instrument(skip(self))]
    pub async fn get_or_create_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<String, ChatError> {
        self.inner.ensure_open()?;
        let inner = &self.inner;

        let mut participants: Vec<String> = Vec::with_capacity(participant_ids.len() + 1);
        for id in std::iter::once(&inner.user_id).chain(participant_ids) {
            let id = id.trim();
            if id.is_empty() {
                return Err(ChatError::InvalidParticipants("empty participant id".into()));
            }
            if !participants.iter().any(|p| p == id) {
                participants.push(id.to_string());
            }
        }
        if participants.len() < 2 {
            return Err(ChatError::InvalidParticipants(
                "a conversation needs another participant".into(),
            ));
        }

        if let Some(existing) = inner
            .store
            .find_conversation(&participants, booking_request_id)
            .await?
        {
            debug!("Reusing conversation {}", existing);
            return Ok(existing);
        }

        let conversation_id = inner
            .store
            .create_conversation(&participants, booking_request_id)
            .await?;
        inner.aggregator.add_known(&conversation_id);
        info!("Created conversation {}", conversation_id);

        for participant in &participants {
            let added = RealtimeEvent::ParticipantAdded(ParticipantAdded {
                conversation_id: conversation_id.clone(),
                user_id: participant.clone(),
            });
            if let Err(e) = inner
                .channels
                .publish(&Topic::user_conversations(participant), &added)
                .await
            {
                warn!("Failed to notify {} of {}: {}", participant, conversation_id, e);
            }
        }
        inner.list_refresh.notify_one();

        Ok(conversation_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.presence.is_online(user_id)
    }

    pub fn online_users(&self) -> HashSet<String> {
        self.inner.presence.online_users()
    }

    /// Users typing in the open conversation, excluding ourselves
    pub fn typing_users(&self) -> Vec<String> {
        self.inner.roster.lock().users(Instant::now())
    }

    /// Report a composer edit in the open conversation
    pub async fn notify_typing(&self, content: &str) -> Result<(), ChatError> {
        self.inner.ensure_open()?;
        let conversation_id = self
            .inner
            .controller
            .active_conversation()
            .ok_or(ChatError::NoActiveConversation)?;
        self.inner
            .typing
            .notify_typing(&conversation_id, content)
            .await;
        Ok(())
    }

    /// Forward tab/app visibility to presence
    pub async fn set_visibility(&self, visible: bool) {
        self.inner.presence.set_visibility(visible).await;
    }

    /// True once a realtime channel reported an error; there is no automatic reconnect
    pub fn channel_error(&self) -> bool {
        self.inner.channels.channel_error()
    }

    /// Tear the session down; later calls fail with `SessionClosed`
    #[instrument(skip(self), fields(user_id = %self.inner.user_id))]
    pub async fn logout(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;

        if let Some(active) = inner.controller.active_conversation() {
            inner.typing.stop_typing(&active).await;
        }
        inner.typing.reset();
        inner.presence.stop().await;
        inner.channels.close_all().await;
        inner.controller.reset();
        inner.aggregator.clear();
        inner.roster.lock().set_conversation(None);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Logged out");
    }
}

impl SessionInner {
    /// Tell viewers of the conversation and every participant's user channel
    async fn announce_message(&self, created: MessageCreated) {
        let event = RealtimeEvent::MessageCreated(created.clone());
        if let Err(e) = self
            .channels
            .publish(&Topic::conversation_messages(&created.conversation_id), &event)
            .await
        {
            warn!("Failed to broadcast message {}: {}", created.message_id, e);
        }

        let participants = match self
            .store
            .conversation_participants(&created.conversation_id)
            .await
        {
            Ok(participants) => participants,
            Err(e) => {
                warn!("Failed to list participants of {}: {}", created.conversation_id, e);
                return;
            }
        };
        for participant in participants {
            if let Err(e) = self
                .channels
                .publish(&Topic::user_conversations(&participant), &event)
                .await
            {
                debug!("Failed to signal {}: {}", participant, e);
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
