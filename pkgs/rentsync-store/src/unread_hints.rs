//! Client-local unread hints
//!
//! A same-device flag keyed by (user, conversation) recording whether the
//! conversation was last seen with unread activity. It is only a hint: it can
//! drift from the server-side counter (cleared storage, other devices), so
//! readers must treat it as the weakest unread signal available.

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::collections::HashMap;
use tracing::debug;

use crate::entities::local_flags;
use crate::error::StoreError;

/// Prefix for unread hint keys in the local flags table
pub const UNREAD_HINT_PREFIX: &str = "unread";

/// Key under which the hint for (user, conversation) is stored
pub fn unread_hint_key(user_id: &str, conversation_id: &str) -> String {
    format!("{}:{}:{}", UNREAD_HINT_PREFIX, user_id, conversation_id)
}

#[async_trait]
pub trait UnreadHints: Send + Sync {
    async fn get(&self, user_id: &str, conversation_id: &str) -> Result<Option<bool>, StoreError>;

    async fn set(
        &self,
        user_id: &str,
        conversation_id: &str,
        unread: bool,
    ) -> Result<(), StoreError>;
}

/// Hints persisted in the `local_flags` table
pub struct SqliteUnreadHints {
    db: DatabaseConnection,
}

impl SqliteUnreadHints {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Remove every hint (e.g. on logout)
    pub async fn clear_all(&self) -> Result<u64, StoreError> {
        let result = local_flags::Entity::delete_many().exec(&self.db).await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl UnreadHints for SqliteUnreadHints {
    async fn get(&self, user_id: &str, conversation_id: &str) -> Result<Option<bool>, StoreError> {
        let key = unread_hint_key(user_id, conversation_id);
        let Some(model) = local_flags::Entity::find_by_id(key.clone())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        match model.value.as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            other => Err(StoreError::InvalidValue {
                field: "local_flags.value",
                value: format!("{}={}", key, other),
            }),
        }
    }

    async fn set(
        &self,
        user_id: &str,
        conversation_id: &str,
        unread: bool,
    ) -> Result<(), StoreError> {
        let key = unread_hint_key(user_id, conversation_id);
        let now = chrono::Utc::now().timestamp_millis();
        debug!("Setting local flag: {}", key);

        let existing = local_flags::Entity::find_by_id(key.clone())
            .one(&self.db)
            .await?;

        if let Some(model) = existing {
            let mut active_model: local_flags::ActiveModel = model.into();
            active_model.value = Set(unread.to_string());
            active_model.updated_at = Set(now);
            active_model.update(&self.db).await?;
        } else {
            let new_flag = local_flags::ActiveModel {
                key: Set(key),
                value: Set(unread.to_string()),
                updated_at: Set(now),
            };
            local_flags::Entity::insert(new_flag)
                .exec_without_returning(&self.db)
                .await?;
        }

        Ok(())
    }
}

/// Hints kept in memory for the lifetime of the process
#[derive(Default)]
pub struct MemoryUnreadHints {
    flags: Mutex<HashMap<String, bool>>,
}

impl MemoryUnreadHints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnreadHints for MemoryUnreadHints {
    async fn get(&self, user_id: &str, conversation_id: &str) -> Result<Option<bool>, StoreError> {
        Ok(self
            .flags
            .lock()
            .get(&unread_hint_key(user_id, conversation_id))
            .copied())
    }

    async fn set(
        &self,
        user_id: &str,
        conversation_id: &str,
        unread: bool,
    ) -> Result<(), StoreError> {
        self.flags
            .lock()
            .insert(unread_hint_key(user_id, conversation_id), unread);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_hint_key_layout() {
        assert_eq!(unread_hint_key("alice", "conv-1"), "unread:alice:conv-1");
    }

    #[tokio::test]
    async fn test_memory_hints_roundtrip() {
        let hints = MemoryUnreadHints::new();
        assert_eq!(hints.get("alice", "conv-1").await.unwrap(), None);

        hints.set("alice", "conv-1", true).await.unwrap();
        assert_eq!(hints.get("alice", "conv-1").await.unwrap(), Some(true));
        assert_eq!(hints.get("bob", "conv-1").await.unwrap(), None);
    }
}
