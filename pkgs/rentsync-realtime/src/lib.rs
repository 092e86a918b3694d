//! Rentsync Realtime - pub/sub channels, presence and typing
//!
//! # Architecture
//!
//! - **Transport / Channel**: the pub/sub primitive (broadcast + presence)
//!   behind async traits, with two implementations:
//!   - [`LocalHub`]: in-process hub, one client per `connect()`
//!   - [`GossipTransport`]: libp2p gossipsub node with mDNS discovery
//! - **ChannelManager**: one active conversation scope and one per-user
//!   channel, torn down on switch, close or drop
//! - **PresenceTracker**: online user set over `presence:global` with a
//!   visibility-aware heartbeat
//! - **TypingBroadcaster / TypingRoster**: debounced typing signals and the
//!   receiving set of typists
//!
//! Inbound broadcasts are decoded at the boundary into [`RealtimeEvent`];
//! malformed payloads are logged and dropped.

pub mod channel_manager;
pub mod error;
pub mod events;
pub mod gossip;
pub mod local;
pub mod presence;
mod registry;
pub mod topic;
pub mod transport;
pub mod typing;

pub use channel_manager::{ChannelManager, ManagerEvent, Scope};
pub use error::RealtimeError;
pub use events::{
    Decoded, MessageCreated, ParticipantAdded, PresenceMeta, PresenceStatus, RealtimeEvent,
    TypingSignal,
};
pub use gossip::{GossipConfig, GossipTransport};
pub use local::{LocalHub, LocalTransport};
pub use presence::{PresenceTracker, PresenceUpdate, DEFAULT_HEARTBEAT_INTERVAL};
pub use topic::Topic;
pub use transport::{
    Channel, ChannelOptions, ChannelStatus, PresenceState, Transport, TransportEvent,
    TransportEvents,
};
pub use typing::{TypingBroadcaster, TypingRoster, DEFAULT_SILENCE_WINDOW};
