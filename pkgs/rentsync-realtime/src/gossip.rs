//! libp2p gossipsub transport
//!
//! Each topic maps to a gossipsub topic of the same name. Broadcasts and
//! presence changes travel as JSON [`Envelope`]s; the swarm task keeps the
//! same [`TopicRegistry`] the in-process hub uses, so local subscribers see
//! identical event semantics. Peers are discovered over mDNS. Remote presence
//! entries expire unless re-announced within the presence TTL.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blake3::Hasher;
use futures::channel::mpsc;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, MessageId, TopicHash, ValidationMode},
    identity::Keypair,
    mdns,
    multiaddr::Protocol,
    swarm::{NetworkBehaviour, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc as command_mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RealtimeError;
use crate::registry::{Subscriber, TopicRegistry};
use crate::topic::Topic;
use crate::transport::{Channel, ChannelOptions, Transport, TransportEvents};

/// Configuration for the gossip node
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub listen_addrs: Vec<Multiaddr>,
    /// Remote presences not re-announced within this window are dropped
    pub presence_ttl: Duration,
    /// How often stale remote presences are swept
    pub expiry_interval: Duration,
    pub gossip_heartbeat: Duration,
    pub idle_connection_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                .with(Protocol::Tcp(0))],
            presence_ttl: Duration::from_secs(90),
            expiry_interval: Duration::from_secs(5),
            gossip_heartbeat: Duration::from_secs(10),
            idle_connection_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeEvent")]
pub struct NodeBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
}

#[derive(Debug)]
pub enum NodeEvent {
    Gossipsub(gossipsub::Event),
    Mdns(mdns::Event),
}

impl From<gossipsub::Event> for NodeEvent {
    fn from(event: gossipsub::Event) -> Self {
        Self::Gossipsub(event)
    }
}

impl From<mdns::Event> for NodeEvent {
    fn from(event: mdns::Event) -> Self {
        Self::Mdns(event)
    }
}

/// Wire format of everything published on a gossip topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Broadcast {
        event: String,
        payload: Value,
        nonce: String,
    },
    Track {
        key: String,
        presence_ref: String,
        meta: Value,
        nonce: String,
    },
    Untrack {
        presence_ref: String,
        nonce: String,
    },
}

fn nonce() -> String {
    Uuid::new_v4().to_string()
}

/// Registry key of a presence announced by `origin`
fn remote_ref(origin: &PeerId, presence_ref: &str) -> String {
    format!("{}/{}", origin, presence_ref)
}

enum Command {
    Subscribe {
        topic: Topic,
        subscription: u64,
        subscriber: Subscriber,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    Unsubscribe {
        topic: Topic,
        subscription: u64,
        presence_ref: String,
    },
    Broadcast {
        topic: Topic,
        subscription: u64,
        event: String,
        payload: Value,
        reply: Option<oneshot::Sender<Result<(), RealtimeError>>>,
    },
    Track {
        topic: Topic,
        key: String,
        presence_ref: String,
        meta: Value,
    },
    Untrack {
        topic: Topic,
        presence_ref: String,
    },
}

fn create_behaviour(keypair: &Keypair, config: &GossipConfig) -> Result<NodeBehaviour> {
    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(config.gossip_heartbeat)
        .validation_mode(ValidationMode::Strict)
        .message_id_fn(|message: &gossipsub::Message| {
            let mut hasher = Hasher::new();
            hasher.update(&message.data);
            MessageId::from(hasher.finalize().as_bytes().to_vec())
        })
        .build()
        .map_err(|e| anyhow!("Failed to build gossipsub config: {}", e))?;

    let gossipsub = gossipsub::Behaviour::new(
        MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| anyhow!("Failed to create gossipsub behaviour: {}", e))?;

    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), keypair.public().to_peer_id())?;

    Ok(NodeBehaviour { gossipsub, mdns })
}

/// Transport backed by a gossipsub swarm running on its own task
#[derive(Clone)]
pub struct GossipTransport {
    commands: command_mpsc::UnboundedSender<Command>,
    next_subscription: Arc<AtomicU64>,
    peer_id: PeerId,
}

impl GossipTransport {
    /// Build the swarm, start listening and spawn the swarm task
    pub fn spawn(keypair: Keypair, config: GossipConfig) -> Result<(Self, JoinHandle<()>)> {
        let peer_id = keypair.public().to_peer_id();
        let behaviour = create_behaviour(&keypair, &config)?;

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_behaviour(|_| behaviour)?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
            .build();

        for addr in &config.listen_addrs {
            swarm.listen_on(addr.clone())?;
        }

        let (commands, receiver) = command_mpsc::unbounded_channel();
        let node = GossipNode {
            swarm,
            registry: TopicRegistry::default(),
            topics: HashMap::new(),
            config,
        };
        let handle = tokio::spawn(node.run(receiver));
        info!("Gossip transport started as {}", peer_id);

        Ok((
            Self {
                commands,
                next_subscription: Arc::new(AtomicU64::new(0)),
                peer_id,
            },
            handle,
        ))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[async_trait]
impl Transport for GossipTransport {
    async fn subscribe(
        &self,
        topic: &Topic,
        options: ChannelOptions,
    ) -> Result<(Arc<dyn Channel>, TransportEvents), RealtimeError> {
        if options.private {
            debug!("Gossip topic {} is open to every peer", topic);
        }

        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                topic: topic.clone(),
                subscription,
                subscriber: Subscriber {
                    sender,
                    self_echo: options.self_echo,
                },
                reply,
            })
            .map_err(|_| RealtimeError::TransportClosed)?;
        response.await.map_err(|_| RealtimeError::TransportClosed)??;

        let channel = GossipChannel {
            topic: topic.clone(),
            subscription,
            presence_ref: format!("{}#{}", self.peer_id, subscription),
            presence_key: options.presence_key,
            ack: options.ack,
            commands: self.commands.clone(),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(channel), receiver))
    }
}

pub struct GossipChannel {
    topic: Topic,
    subscription: u64,
    presence_ref: String,
    presence_key: Option<String>,
    ack: bool,
    commands: command_mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
}

impl GossipChannel {
    fn command(&self, command: Command) -> Result<(), RealtimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RealtimeError::ChannelClosed(self.topic.to_string()));
        }
        self.commands
            .send(command)
            .map_err(|_| RealtimeError::TransportClosed)
    }

    fn close(&self) -> Result<(), RealtimeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.commands
            .send(Command::Unsubscribe {
                topic: self.topic.clone(),
                subscription: self.subscription,
                presence_ref: self.presence_ref.clone(),
            })
            .map_err(|_| RealtimeError::TransportClosed)
    }
}

#[async_trait]
impl Channel for GossipChannel {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), RealtimeError> {
        if !self.ack {
            return self.command(Command::Broadcast {
                topic: self.topic.clone(),
                subscription: self.subscription,
                event: event.to_string(),
                payload,
                reply: None,
            });
        }

        let (reply, response) = oneshot::channel();
        self.command(Command::Broadcast {
            topic: self.topic.clone(),
            subscription: self.subscription,
            event: event.to_string(),
            payload,
            reply: Some(reply),
        })?;
        response.await.map_err(|_| RealtimeError::TransportClosed)?
    }

    async fn track(&self, meta: Value) -> Result<(), RealtimeError> {
        let key = self
            .presence_key
            .clone()
            .ok_or_else(|| RealtimeError::PresenceKeyMissing(self.topic.to_string()))?;
        self.command(Command::Track {
            topic: self.topic.clone(),
            key,
            presence_ref: self.presence_ref.clone(),
            meta,
        })
    }

    async fn untrack(&self) -> Result<(), RealtimeError> {
        self.command(Command::Untrack {
            topic: self.topic.clone(),
            presence_ref: self.presence_ref.clone(),
        })
    }

    async fn unsubscribe(&self) -> Result<(), RealtimeError> {
        self.close()
    }
}

impl Drop for GossipChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct GossipNode {
    swarm: Swarm<NodeBehaviour>,
    registry: TopicRegistry,
    topics: HashMap<TopicHash, Topic>,
    config: GossipConfig,
}

impl GossipNode {
    async fn run(mut self, mut commands: command_mpsc::UnboundedReceiver<Command>) {
        let mut expiry = tokio::time::interval(self.config.expiry_interval);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All gossip handles dropped, stopping swarm task");
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = expiry.tick() => {
                    let expired = self.registry.expire_remote(Instant::now(), self.config.presence_ttl);
                    if expired > 0 {
                        debug!("Expired {} remote presences", expired);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topic,
                subscription,
                subscriber,
                reply,
            } => {
                let result = self.join_topic(&topic).map(|_| {
                    self.registry.add_subscriber(&topic, subscription, subscriber);
                });
                let _ = reply.send(result);
            }
            Command::Unsubscribe {
                topic,
                subscription,
                presence_ref,
            } => {
                if self.registry.untrack(&topic, &presence_ref) {
                    self.announce(
                        &topic,
                        &Envelope::Untrack {
                            presence_ref,
                            nonce: nonce(),
                        },
                    );
                }
                if self.registry.remove_subscriber(&topic, subscription) {
                    self.leave_topic(&topic);
                }
            }
            Command::Broadcast {
                topic,
                subscription,
                event,
                payload,
                reply,
            } => {
                let envelope = Envelope::Broadcast {
                    event: event.clone(),
                    payload: payload.clone(),
                    nonce: nonce(),
                };
                let result = self.publish(&topic, &envelope);
                if result.is_ok() {
                    self.registry
                        .broadcast(&topic, Some(subscription), &event, payload);
                }
                match (reply, result) {
                    (Some(reply), result) => {
                        let _ = reply.send(result);
                    }
                    (None, Err(e)) => debug!("Dropped '{}' on {}: {}", event, topic, e),
                    (None, Ok(())) => {}
                }
            }
            Command::Track {
                topic,
                key,
                presence_ref,
                meta,
            } => {
                self.registry.track(
                    &topic,
                    &key,
                    &presence_ref,
                    meta.clone(),
                    false,
                    Instant::now(),
                );
                self.announce(
                    &topic,
                    &Envelope::Track {
                        key,
                        presence_ref,
                        meta,
                        nonce: nonce(),
                    },
                );
            }
            Command::Untrack {
                topic,
                presence_ref,
            } => {
                if self.registry.untrack(&topic, &presence_ref) {
                    self.announce(
                        &topic,
                        &Envelope::Untrack {
                            presence_ref,
                            nonce: nonce(),
                        },
                    );
                }
            }
        }
    }

    fn join_topic(&mut self, topic: &Topic) -> Result<(), RealtimeError> {
        if self.registry.subscriber_count(topic) > 0 {
            return Ok(());
        }

        let ident = IdentTopic::new(topic.as_str());
        self.swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&ident)
            .map_err(|e| RealtimeError::SubscribeRefused {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.topics.insert(ident.hash(), topic.clone());
        debug!("Joined gossip topic {}", topic);
        Ok(())
    }

    fn leave_topic(&mut self, topic: &Topic) {
        let ident = IdentTopic::new(topic.as_str());
        let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&ident);
        self.topics.remove(&ident.hash());
        debug!("Left gossip topic {}", topic);
    }

    /// Hand an envelope to gossipsub. Having no peers on the topic yet is
    /// not a rejection.
    fn publish(&mut self, topic: &Topic, envelope: &Envelope) -> Result<(), RealtimeError> {
        let data = serde_json::to_vec(envelope)?;
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(topic.as_str()), data)
        {
            Ok(_) | Err(gossipsub::PublishError::NoPeersSubscribedToTopic) => Ok(()),
            Err(e) => Err(RealtimeError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Publish a presence change; failures only cost remote peers an update
    fn announce(&mut self, topic: &Topic, envelope: &Envelope) {
        if let Err(e) = self.publish(topic, envelope) {
            warn!("Presence update on {} not published: {}", topic, e);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let origin = message.source.unwrap_or(propagation_source);
                self.handle_message(origin, &message.topic, &message.data);
            }
            SwarmEvent::Behaviour(NodeEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, _addr) in list {
                    debug!("Discovered peer {}", peer_id);
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(&peer_id);
                }
            }
            SwarmEvent::Behaviour(NodeEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer_id, _addr) in list {
                    if self.swarm.is_connected(&peer_id) {
                        continue;
                    }
                    debug!("Peer {} expired", peer_id);
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .remove_explicit_peer(&peer_id);
                    let dropped = self
                        .registry
                        .untrack_prefixed(&remote_ref(&peer_id, ""));
                    if dropped > 0 {
                        debug!("Dropped {} presences of {}", dropped, peer_id);
                    }
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            _ => {}
        }
    }

    fn handle_message(&mut self, origin: PeerId, topic_hash: &TopicHash, data: &[u8]) {
        let Some(topic) = self.topics.get(topic_hash).cloned() else {
            debug!("Message for unknown topic {}", topic_hash);
            return;
        };

        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed envelope on {} from {}: {}", topic, origin, e);
                return;
            }
        };

        match envelope {
            Envelope::Broadcast { event, payload, .. } => {
                self.registry.broadcast(&topic, None, &event, payload);
            }
            Envelope::Track {
                key,
                presence_ref,
                meta,
                ..
            } => {
                self.registry.track(
                    &topic,
                    &key,
                    &remote_ref(&origin, &presence_ref),
                    meta,
                    true,
                    Instant::now(),
                );
            }
            Envelope::Untrack { presence_ref, .. } => {
                self.registry
                    .untrack(&topic, &remote_ref(&origin, &presence_ref));
            }
        }
    }
}
