//! Error types for the chat layer

use rentsync_realtime::RealtimeError;
use rentsync_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),
    #[error("No active conversation")]
    NoActiveConversation,
    #[error("Session is closed")]
    SessionClosed,
}
