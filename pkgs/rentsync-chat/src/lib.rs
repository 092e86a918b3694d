//! Rentsync Chat - conversation list, message stream and session facade
//!
//! # Architecture
//!
//! - **ConversationAggregator**: builds the display-ready conversation list
//!   from summary rows, profiles, last messages, bookings and read markers
//! - **Unread cascade**: counter, read marker, local hint, then a
//!   deduplicated fallback diagnostic
//! - **MessageStreamController**: fenced history fetch, idempotent append,
//!   optimistic send
//! - **ChatSession**: one logged-in user; wires the above to the realtime
//!   channel manager, presence and typing
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rentsync_chat::{ChatConfig, ChatSession};
//! use rentsync_realtime::LocalHub;
//! use rentsync_store::{MemoryUnreadHints, SqliteStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::connect("sqlite::memory:").await?);
//! let hub = LocalHub::new();
//!
//! let (session, _events) = ChatSession::start(
//!     "alice",
//!     store,
//!     Arc::new(MemoryUnreadHints::new()),
//!     Arc::new(hub.connect("alice")),
//!     ChatConfig::default(),
//! )
//! .await?;
//!
//! let conversation_id = session
//!     .get_or_create_conversation(&["bob".to_string()], None)
//!     .await?;
//! session.fetch_messages(&conversation_id).await?;
//! session.send_message(&conversation_id, "Is the kayak free on Saturday?").await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod fence;
pub mod session;
pub mod unread;

pub use aggregator::{Conversation, ConversationAggregator, ConversationListState, ParticipantSummary};
pub use config::ChatConfig;
pub use controller::{FetchOutcome, MessageListState, MessageStreamController};
pub use diagnostics::FallbackDiagnostics;
pub use error::ChatError;
pub use fence::{ActiveCell, FenceToken, LatestOnly};
pub use session::{ChatEvent, ChatSession};
pub use unread::{UnreadInputs, UnreadResolution, UnreadSource};
