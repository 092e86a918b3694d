//! Online presence over the global presence topic
//!
//! The tracker subscribes to `presence:global` with the user id as presence
//! key, announces itself, and re-announces on a heartbeat. Hiding the client
//! stops the heartbeat and withdraws the presence; showing it again announces
//! exactly once and restarts the heartbeat. The set of online user ids is
//! rebuilt from every sync and patched by join/leave events.

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::error::RealtimeError;
use crate::events::PresenceMeta;
use crate::topic::Topic;
use crate::transport::{Channel, ChannelOptions, Transport, TransportEvent, TransportEvents};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Snapshot of online user ids, sent whenever the set changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub online: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Joining,
    Live,
    Hidden,
}

struct Session {
    phase: Phase,
    epoch: u64,
    user_id: Option<String>,
    visible: bool,
    channel: Option<Arc<dyn Channel>>,
    heartbeat: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            epoch: 0,
            user_id: None,
            visible: true,
            channel: None,
            heartbeat: None,
            pump: None,
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    heartbeat_interval: Duration,
    online: RwLock<HashSet<String>>,
    session: Mutex<Session>,
    announces: AtomicU64,
    updates: mpsc::UnboundedSender<PresenceUpdate>,
}

enum VisibilityAction {
    Announce(Arc<dyn Channel>, String),
    Withdraw(Arc<dyn Channel>),
}

pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    pub fn new(
        transport: Arc<dyn Transport>,
        heartbeat_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PresenceUpdate>) {
        let (updates, receiver) = mpsc::unbounded();
        let inner = Inner {
            transport,
            heartbeat_interval,
            online: RwLock::new(HashSet::new()),
            session: Mutex::new(Session::default()),
            announces: AtomicU64::new(0),
            updates,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.online.read().contains(user_id)
    }

    pub fn online_users(&self) -> HashSet<String> {
        self.inner.online.read().clone()
    }

    /// Number of presence announcements made so far
    pub fn announce_count(&self) -> u64 {
        self.inner.announces.load(Ordering::Relaxed)
    }

    /// Join the presence topic as `user_id` and announce when visible
    #[instrument(skip(self))]
    pub async fn start(&self, user_id: &str) -> Result<(), RealtimeError> {
        let epoch = {
            let mut session = self.inner.session.lock();
            if session.phase != Phase::Idle {
                debug!("Presence already started");
                return Ok(());
            }
            session.epoch += 1;
            session.phase = Phase::Joining;
            session.user_id = Some(user_id.to_string());
            session.epoch
        };

        let subscribed = self
            .inner
            .transport
            .subscribe(
                &Topic::presence_global(),
                ChannelOptions::default().with_presence_key(user_id),
            )
            .await;
        let (channel, receiver) = match subscribed {
            Ok(subscribed) => subscribed,
            Err(e) => {
                let mut session = self.inner.session.lock();
                if session.epoch == epoch {
                    session.phase = Phase::Idle;
                    session.user_id = None;
                }
                return Err(e);
            }
        };

        let visible = {
            let mut session = self.inner.session.lock();
            if session.epoch != epoch {
                None
            } else {
                session.channel = Some(channel.clone());
                session.pump = Some(tokio::spawn(pump_presence(self.inner.clone(), receiver)));
                Some(session.visible)
            }
        };

        match visible {
            None => {
                debug!("Logged out while joining presence, discarding channel");
                if let Err(e) = channel.unsubscribe().await {
                    warn!("Failed to close presence channel: {}", e);
                }
                return Ok(());
            }
            Some(true) => announce(&self.inner, &channel, user_id).await,
            Some(false) => {}
        }

        let withdraw = {
            let mut session = self.inner.session.lock();
            if session.epoch != epoch {
                return Ok(());
            }
            if session.visible {
                session.phase = Phase::Live;
                session.heartbeat = Some(spawn_heartbeat(
                    self.inner.clone(),
                    channel.clone(),
                    user_id.to_string(),
                ));
                false
            } else {
                session.phase = Phase::Hidden;
                visible == Some(true)
            }
        };

        if withdraw {
            if let Err(e) = channel.untrack().await {
                warn!("Failed to withdraw presence: {}", e);
            }
        }
        info!("Presence started for {}", user_id);
        Ok(())
    }

    /// React to the client becoming hidden or visible
    pub async fn set_visibility(&self, visible: bool) {
        let action = {
            let mut session = self.inner.session.lock();
            session.visible = visible;
            match (session.phase, visible, session.channel.clone()) {
                (Phase::Live, false, Some(channel)) => {
                    session.phase = Phase::Hidden;
                    if let Some(heartbeat) = session.heartbeat.take() {
                        heartbeat.abort();
                    }
                    Some(VisibilityAction::Withdraw(channel))
                }
                (Phase::Hidden, true, Some(channel)) => {
                    session.phase = Phase::Live;
                    let user_id = session.user_id.clone().unwrap_or_default();
                    if let Some(stale) = session.heartbeat.replace(spawn_heartbeat(
                        self.inner.clone(),
                        channel.clone(),
                        user_id.clone(),
                    )) {
                        stale.abort();
                    }
                    Some(VisibilityAction::Announce(channel, user_id))
                }
                _ => None,
            }
        };

        match action {
            Some(VisibilityAction::Announce(channel, user_id)) => {
                debug!("Visible again, re-announcing {}", user_id);
                announce(&self.inner, &channel, &user_id).await;
            }
            Some(VisibilityAction::Withdraw(channel)) => {
                debug!("Hidden, withdrawing presence");
                if let Err(e) = channel.untrack().await {
                    warn!("Failed to withdraw presence: {}", e);
                }
            }
            None => {}
        }
    }

    /// Leave the presence topic: untrack, stop the heartbeat, remove the
    /// channel, then clear the online set
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let (channel, heartbeat, pump) = {
            let mut session = self.inner.session.lock();
            session.epoch += 1;
            session.phase = Phase::Idle;
            session.user_id = None;
            (
                session.channel.take(),
                session.heartbeat.take(),
                session.pump.take(),
            )
        };

        if let Some(channel) = &channel {
            if let Err(e) = channel.untrack().await {
                debug!("Untrack on logout failed: {}", e);
            }
        }
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        if let Some(channel) = channel {
            if let Err(e) = channel.unsubscribe().await {
                warn!("Failed to close presence channel: {}", e);
            }
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        self.inner.online.write().clear();
        let _ = self
            .inner
            .updates
            .unbounded_send(PresenceUpdate { online: Vec::new() });
        info!("Presence stopped");
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        let mut session = self.inner.session.lock();
        if let Some(heartbeat) = session.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(pump) = session.pump.take() {
            pump.abort();
        }
    }
}

async fn announce(inner: &Inner, channel: &Arc<dyn Channel>, user_id: &str) {
    let meta = match PresenceMeta::online(user_id).to_value() {
        Ok(meta) => meta,
        Err(e) => {
            warn!("Failed to encode presence meta: {}", e);
            return;
        }
    };
    inner.announces.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = channel.track(meta).await {
        warn!("Presence announce failed: {}", e);
    }
}

fn spawn_heartbeat(inner: Arc<Inner>, channel: Arc<dyn Channel>, user_id: String) -> JoinHandle<()> {
    let period = inner.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            announce(&inner, &channel, &user_id).await;
        }
    })
}

async fn pump_presence(inner: Arc<Inner>, mut receiver: TransportEvents) {
    while let Some(event) = receiver.next().await {
        let changed = match event {
            TransportEvent::PresenceSync { state } => {
                let online: HashSet<String> = state
                    .iter()
                    .filter(|(key, metas)| valid_metas(key, metas))
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut current = inner.online.write();
                if *current != online {
                    *current = online;
                    true
                } else {
                    false
                }
            }
            TransportEvent::PresenceJoin { key, metas } => {
                valid_metas(&key, &metas) && inner.online.write().insert(key)
            }
            TransportEvent::PresenceLeave { key, metas } => {
                valid_metas(&key, &metas) && inner.online.write().remove(&key)
            }
            TransportEvent::Status(status) => {
                if status.is_failure() {
                    warn!("Presence channel reported {:?}", status);
                }
                false
            }
            TransportEvent::Broadcast { event, .. } => {
                debug!("Ignoring broadcast '{}' on presence topic", event);
                false
            }
        };

        if changed {
            let mut online: Vec<String> = inner.online.read().iter().cloned().collect();
            online.sort();
            let _ = inner.updates.unbounded_send(PresenceUpdate { online });
        }
    }
}

/// True when `metas` is non-empty and every meta decodes for `key`
fn valid_metas(key: &str, metas: &[serde_json::Value]) -> bool {
    if metas.is_empty() {
        warn!("Ignoring presence for '{}' without metas", key);
        return false;
    }
    for meta in metas {
        if let Err(e) = PresenceMeta::from_value(key, meta) {
            warn!("Ignoring malformed presence for '{}': {}", key, e);
            return false;
        }
    }
    true
}
