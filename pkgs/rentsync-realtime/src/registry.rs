//! Topic fan-out and presence bookkeeping shared by the transports

use futures::channel::mpsc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::topic::Topic;
use crate::transport::{ChannelStatus, PresenceState, TransportEvent};

pub(crate) struct Subscriber {
    pub sender: mpsc::UnboundedSender<TransportEvent>,
    pub self_echo: bool,
}

struct PresenceEntry {
    meta: Value,
    refreshed_at: Instant,
    remote: bool,
}

#[derive(Default)]
struct TopicState {
    subscribers: HashMap<u64, Subscriber>,
    /// presence key -> presence ref -> entry
    presences: BTreeMap<String, BTreeMap<String, PresenceEntry>>,
}

impl TopicState {
    fn snapshot(&self) -> PresenceState {
        self.presences
            .iter()
            .map(|(key, entries)| {
                let metas = entries.values().map(|entry| entry.meta.clone()).collect();
                (key.clone(), metas)
            })
            .collect()
    }

    /// Deliver to every subscriber except `skip`, dropping subscribers whose stream is gone
    fn emit(&mut self, event: TransportEvent, skip: Option<u64>) {
        self.subscribers.retain(|id, subscriber| {
            if Some(*id) == skip {
                return true;
            }
            subscriber.sender.unbounded_send(event.clone()).is_ok()
        });
    }

    fn emit_sync(&mut self) {
        let state = self.snapshot();
        self.emit(TransportEvent::PresenceSync { state }, None);
    }

    /// Remove `presence_ref` wherever it lives; returns the key and meta when
    /// that was the key's last presence
    fn remove_ref(&mut self, presence_ref: &str) -> Option<(String, Value, bool)> {
        let key = self
            .presences
            .iter()
            .find(|(_, entries)| entries.contains_key(presence_ref))
            .map(|(key, _)| key.clone())?;

        let entries = self.presences.get_mut(&key)?;
        let entry = entries.remove(presence_ref)?;
        let last = entries.is_empty();
        if last {
            self.presences.remove(&key);
        }
        Some((key, entry.meta, last))
    }
}

#[derive(Default)]
pub(crate) struct TopicRegistry {
    topics: HashMap<Topic, TopicState>,
}

impl TopicRegistry {
    /// Register a subscriber and hand it the current presence state.
    /// Returns true when it is the topic's first subscriber.
    pub fn add_subscriber(&mut self, topic: &Topic, id: u64, subscriber: Subscriber) -> bool {
        let state = self.topics.entry(topic.clone()).or_default();
        let first = state.subscribers.is_empty();

        let _ = subscriber
            .sender
            .unbounded_send(TransportEvent::Status(ChannelStatus::Subscribed));
        let _ = subscriber.sender.unbounded_send(TransportEvent::PresenceSync {
            state: state.snapshot(),
        });
        state.subscribers.insert(id, subscriber);
        first
    }

    /// Close a subscriber's stream. Returns true when the topic has no
    /// subscribers left, in which case its state is dropped.
    pub fn remove_subscriber(&mut self, topic: &Topic, id: u64) -> bool {
        let Some(state) = self.topics.get_mut(topic) else {
            return false;
        };
        let Some(subscriber) = state.subscribers.remove(&id) else {
            return false;
        };

        let _ = subscriber
            .sender
            .unbounded_send(TransportEvent::Status(ChannelStatus::Closed));
        subscriber.sender.close_channel();

        if state.subscribers.is_empty() {
            self.topics.remove(topic);
            true
        } else {
            false
        }
    }

    /// Fan a broadcast out; `origin` only receives it when it asked for self-echo
    pub fn broadcast(&mut self, topic: &Topic, origin: Option<u64>, event: &str, payload: Value) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };

        let skip = origin.filter(|id| {
            state
                .subscribers
                .get(id)
                .map(|subscriber| !subscriber.self_echo)
                .unwrap_or(true)
        });

        state.emit(
            TransportEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
            skip,
        );
    }

    pub fn track(
        &mut self,
        topic: &Topic,
        key: &str,
        presence_ref: &str,
        meta: Value,
        remote: bool,
        now: Instant,
    ) {
        let Some(state) = self.topics.get_mut(topic) else {
            debug!("Ignoring presence for unsubscribed topic {}", topic);
            return;
        };

        let already_here = state
            .presences
            .get(key)
            .map(|entries| entries.contains_key(presence_ref))
            .unwrap_or(false);

        if !already_here {
            if let Some((old_key, old_meta, true)) = state.remove_ref(presence_ref) {
                state.emit(
                    TransportEvent::PresenceLeave {
                        key: old_key,
                        metas: vec![old_meta],
                    },
                    None,
                );
            }
        }

        let entries = state.presences.entry(key.to_string()).or_default();
        let first = entries.is_empty();
        entries.insert(
            presence_ref.to_string(),
            PresenceEntry {
                meta: meta.clone(),
                refreshed_at: now,
                remote,
            },
        );

        if first {
            state.emit(
                TransportEvent::PresenceJoin {
                    key: key.to_string(),
                    metas: vec![meta],
                },
                None,
            );
        }
        state.emit_sync();
    }

    /// Withdraw a presence; returns false when it was not tracked
    pub fn untrack(&mut self, topic: &Topic, presence_ref: &str) -> bool {
        let Some(state) = self.topics.get_mut(topic) else {
            return false;
        };
        let Some((key, meta, last)) = state.remove_ref(presence_ref) else {
            return false;
        };

        if last {
            state.emit(
                TransportEvent::PresenceLeave {
                    key,
                    metas: vec![meta],
                },
                None,
            );
        }
        state.emit_sync();
        true
    }

    /// Drop remote presences not refreshed within `ttl`
    pub fn expire_remote(&mut self, now: Instant, ttl: Duration) -> usize {
        let stale: Vec<(Topic, String)> = self
            .topics
            .iter()
            .flat_map(|(topic, state)| {
                state.presences.values().flat_map(move |entries| {
                    entries
                        .iter()
                        .filter(move |(_, entry)| {
                            entry.remote && now.saturating_duration_since(entry.refreshed_at) >= ttl
                        })
                        .map(move |(presence_ref, _)| (topic.clone(), presence_ref.clone()))
                })
            })
            .collect();

        for (topic, presence_ref) in &stale {
            debug!("Presence {} on {} expired", presence_ref, topic);
            self.untrack(topic, presence_ref);
        }
        stale.len()
    }

    /// Drop every presence whose ref starts with `prefix` (a departed peer)
    pub fn untrack_prefixed(&mut self, prefix: &str) -> usize {
        let refs: Vec<(Topic, String)> = self
            .topics
            .iter()
            .flat_map(|(topic, state)| {
                state.presences.values().flat_map(move |entries| {
                    entries
                        .keys()
                        .filter(move |presence_ref| presence_ref.starts_with(prefix))
                        .map(move |presence_ref| (topic.clone(), presence_ref.clone()))
                })
            })
            .collect();

        for (topic, presence_ref) in &refs {
            self.untrack(topic, presence_ref);
        }
        refs.len()
    }

    /// Report a channel failure to every subscriber of `topic`
    pub fn fail(&mut self, topic: &Topic, reason: &str) {
        if let Some(state) = self.topics.get_mut(topic) {
            state.emit(
                TransportEvent::Status(ChannelStatus::Errored(reason.to_string())),
                None,
            );
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }

    pub fn presence_keys(&self, topic: &Topic) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|state| state.presences.keys().cloned().collect())
            .unwrap_or_default()
    }
}
