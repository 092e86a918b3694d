//! Error types for store operations

use thiserror::Error;

/// Errors that can occur while reading or writing the store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Local storage unavailable: {0}")]
    LocalStorage(String),
}
