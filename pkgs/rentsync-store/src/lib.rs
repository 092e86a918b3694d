//! Rentsync Store - conversation and message storage for the realtime core
//!
//! This crate defines the data-store interface the realtime conversation core
//! consumes, the records that cross it, and a SQLite implementation using
//! Sea-ORM.
//!
//! # Architecture
//!
//! - **DataStore**: async trait covering membership lookups, denormalized
//!   conversation summaries, batch profile/message/booking lookups, read
//!   markers, message insert and conversation touch
//! - **SqliteStore**: Sea-ORM implementation of `DataStore`
//! - **UnreadHints**: client-local (same-device) unread flags, persisted in
//!   `local_flags` or kept in memory
//!
//! # Database Schema
//!
//! - `profiles`: display name, email, last-seen timestamp
//! - `booking_requests`: read-only rental metadata
//! - `conversations`: booking link, last message id, created/updated timestamps
//! - `conversation_participants`: per-user unread counter and last-read marker
//! - `messages`: immutable message records
//! - `local_flags`: key/value client-local flags
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rentsync_store::{DataStore, MessageKind, NewMessage, SqliteStore, StoreConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::with_config(&StoreConfig::default()).await?;
//!
//! let conversation_id = store
//!     .create_conversation(&["alice".to_string(), "bob".to_string()], None)
//!     .await?;
//!
//! store
//!     .insert_message(NewMessage {
//!         conversation_id,
//!         sender_id: "alice".to_string(),
//!         content: "Is the tent still available?".to_string(),
//!         kind: MessageKind::Text,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod data_store;
pub mod entities;
pub mod error;
pub mod migration;
pub mod models;
pub mod sqlite_store;
pub mod unread_hints;

pub use data_store::DataStore;
pub use error::StoreError;
pub use models::{
    BookingRequest, BookingStatus, Message, MessageKind, NewMessage, Profile, ReadMarker,
    SummaryRow, MAX_MESSAGE_LENGTH,
};
pub use sqlite_store::SqliteStore;
pub use unread_hints::{MemoryUnreadHints, SqliteUnreadHints, UnreadHints};

/// Configuration for the persistence layer
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: std::path::PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: std::path::PathBuf::from("rentsync.db"),
        }
    }
}
