//! SQLite-backed data store using Sea-ORM

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use sea_orm_migration::MigratorTrait;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::data_store::DataStore;
use crate::entities::{
    booking_requests, conversation_participants, conversations, messages, profiles,
};
use crate::error::StoreError;
use crate::models::{
    BookingRequest, Message, NewMessage, Profile, ReadMarker, SummaryRow,
};
use crate::StoreConfig;

/// Data store over a Sea-ORM SQLite connection
pub struct SqliteStore {
    pub(crate) db: DatabaseConnection,
    /// Last issued message timestamp, keeps created-at strictly increasing
    last_timestamp: Mutex<i64>,
}

impl SqliteStore {
    /// Open (or create) the database file described by `config`
    pub async fn with_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let db_path_str = config
            .db_path
            .to_str()
            .ok_or_else(|| StoreError::InvalidValue {
                field: "db_path",
                value: config.db_path.display().to_string(),
            })?
            .replace('\\', "/");

        let store = Self::connect(&format!("sqlite:{}?mode=rwc", db_path_str)).await?;
        info!("Store initialized at {}", config.db_path.display());
        Ok(store)
    }

    /// Connect to a database url (e.g. `sqlite::memory:`) and run migrations
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let db = Database::connect(url).await?;
        crate::migration::Migrator::up(&db, None).await?;
        Ok(Self::with_connection(db))
    }

    /// Create a store with an existing, already migrated, connection
    pub fn with_connection(db: DatabaseConnection) -> Self {
        Self {
            db,
            last_timestamp: Mutex::new(0),
        }
    }

    /// Connection shared with other managers (e.g. local flags)
    pub fn connection(&self) -> DatabaseConnection {
        self.db.clone()
    }

    /// Create or update a profile
    pub async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let existing = profiles::Entity::find_by_id(profile.id.clone())
            .one(&self.db)
            .await?;

        if let Some(model) = existing {
            let mut active: profiles::ActiveModel = model.into();
            active.display_name = Set(profile.display_name.clone());
            active.email = Set(profile.email.clone());
            active.last_seen_at = Set(profile.last_seen_at.map(|t| t.timestamp_millis()));
            active.update(&self.db).await?;
        } else {
            let model = profiles::ActiveModel {
                id: Set(profile.id.clone()),
                display_name: Set(profile.display_name.clone()),
                email: Set(profile.email.clone()),
                last_seen_at: Set(profile.last_seen_at.map(|t| t.timestamp_millis())),
                created_at: Set(Utc::now().timestamp_millis()),
            };
            profiles::Entity::insert(model)
                .exec_without_returning(&self.db)
                .await?;
        }

        debug!("Profile '{}' saved", profile.id);
        Ok(())
    }

    /// Create or update booking metadata
    pub async fn upsert_booking_request(&self, booking: &BookingRequest) -> Result<(), StoreError> {
        let existing = booking_requests::Entity::find_by_id(booking.id.clone())
            .one(&self.db)
            .await?;

        if let Some(model) = existing {
            let mut active: booking_requests::ActiveModel = model.into();
            active.equipment_title = Set(booking.equipment_title.clone());
            active.status = Set(booking.status.as_str().to_string());
            active.start_date = Set(booking.start_date.timestamp_millis());
            active.end_date = Set(booking.end_date.timestamp_millis());
            active.update(&self.db).await?;
        } else {
            let model = booking_requests::ActiveModel {
                id: Set(booking.id.clone()),
                equipment_title: Set(booking.equipment_title.clone()),
                status: Set(booking.status.as_str().to_string()),
                start_date: Set(booking.start_date.timestamp_millis()),
                end_date: Set(booking.end_date.timestamp_millis()),
                created_at: Set(Utc::now().timestamp_millis()),
            };
            booking_requests::Entity::insert(model)
                .exec_without_returning(&self.db)
                .await?;
        }

        Ok(())
    }

    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_timestamp.lock();
        let ts = now.max(*last + 1);
        *last = ts;
        ts
    }

    fn model_to_message(model: messages::Model) -> Result<Message, StoreError> {
        Ok(Message {
            id: model.id,
            conversation_id: model.conversation_id,
            sender_id: model.sender_id,
            content: model.content,
            kind: model.kind.parse()?,
            created_at: from_millis("message.created_at", model.created_at)?,
        })
    }

    async fn participant_rows(
        &self,
        conversation_ids: &[String],
    ) -> Result<Vec<conversation_participants::Model>, StoreError> {
        Ok(conversation_participants::Entity::find()
            .filter(conversation_participants::Column::ConversationId.is_in(conversation_ids.to_vec()))
            .order_by_asc(conversation_participants::Column::ConversationId)
            .order_by_asc(conversation_participants::Column::JoinedAt)
            .order_by_asc(conversation_participants::Column::UserId)
            .all(&self.db)
            .await?)
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .all(&self.db)
            .await?;

        Ok(rows.into_iter().map(|r| r.conversation_id).collect())
    }

    async fn conversation_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self.participant_rows(&[conversation_id.to_string()]).await?;
        Ok(rows.into_iter().map(|r| r.user_id).collect())
    }

    #[instrument(skip(self))]
    async fn conversation_summaries(
        &self,
        conversation_ids: &[String],
    ) -> Result<Vec<SummaryRow>, StoreError> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let convs: HashMap<String, conversations::Model> = conversations::Entity::find()
            .filter(conversations::Column::Id.is_in(conversation_ids.to_vec()))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let participants = self.participant_rows(conversation_ids).await?;

        let user_ids: Vec<String> = participants
            .iter()
            .map(|p| p.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let profile_rows: HashMap<String, profiles::Model> = profiles::Entity::find()
            .filter(profiles::Column::Id.is_in(user_ids))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut rows = Vec::with_capacity(participants.len());
        for participant in participants {
            let Some(conv) = convs.get(&participant.conversation_id) else {
                continue;
            };
            let profile = profile_rows.get(&participant.user_id);
            rows.push(SummaryRow {
                conversation_id: conv.id.clone(),
                participant_id: participant.user_id.clone(),
                participant_email: profile.map(|p| p.email.clone()).unwrap_or_default(),
                last_seen_at: profile
                    .and_then(|p| p.last_seen_at)
                    .and_then(DateTime::<Utc>::from_timestamp_millis),
                last_message_id: conv.last_message_id.clone(),
                booking_request_id: conv.booking_request_id.clone(),
                unread_count: i64::from(participant.unread_count),
                created_at: from_millis("conversation.created_at", conv.created_at)?,
                updated_at: from_millis("conversation.updated_at", conv.updated_at)?,
            });
        }

        Ok(rows)
    }

    async fn profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, StoreError> {
        let rows = profiles::Entity::find()
            .filter(profiles::Column::Id.is_in(user_ids.to_vec()))
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|m| Profile {
                id: m.id,
                display_name: m.display_name,
                email: m.email,
                last_seen_at: m.last_seen_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            })
            .collect())
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = messages::Entity::find()
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .order_by_asc(messages::Column::CreatedAt)
            .order_by_asc(messages::Column::Id)
            .all(&self.db)
            .await?;

        rows.into_iter().map(Self::model_to_message).collect()
    }

    async fn messages_by_ids(&self, message_ids: &[String]) -> Result<Vec<Message>, StoreError> {
        let rows = messages::Entity::find()
            .filter(messages::Column::Id.is_in(message_ids.to_vec()))
            .order_by_asc(messages::Column::CreatedAt)
            .all(&self.db)
            .await?;

        rows.into_iter().map(Self::model_to_message).collect()
    }

    async fn booking_requests(&self, ids: &[String]) -> Result<Vec<BookingRequest>, StoreError> {
        let rows = booking_requests::Entity::find()
            .filter(booking_requests::Column::Id.is_in(ids.to_vec()))
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|m| {
                Ok(BookingRequest {
                    status: m.status.parse()?,
                    start_date: from_millis("booking_request.start_date", m.start_date)?,
                    end_date: from_millis("booking_request.end_date", m.end_date)?,
                    id: m.id,
                    equipment_title: m.equipment_title,
                })
            })
            .collect()
    }

    async fn read_markers(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<Vec<ReadMarker>, StoreError> {
        let rows = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::ConversationId.is_in(conversation_ids.to_vec()))
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| ReadMarker {
                conversation_id: r.conversation_id,
                user_id: r.user_id,
                last_read_at: r.last_read_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<(), StoreError> {
        let now = self.next_timestamp();
        let result = conversation_participants::Entity::update_many()
            .col_expr(conversation_participants::Column::UnreadCount, Expr::value(0))
            .col_expr(conversation_participants::Column::LastReadAt, Expr::value(now))
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }

        debug!("Marked '{}' read for {}", conversation_id, user_id);
        Ok(())
    }

    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id))]
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        message.validate()?;

        let txn = self.db.begin().await?;

        let conv = conversations::Entity::find_by_id(message.conversation_id.clone())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound(message.conversation_id.clone()))?;

        let is_participant = conversation_participants::Entity::find_by_id((
            message.conversation_id.clone(),
            message.sender_id.clone(),
        ))
        .one(&txn)
        .await?
        .is_some();
        if !is_participant {
            return Err(StoreError::Validation(format!(
                "{} is not a participant of {}",
                message.sender_id, message.conversation_id
            )));
        }

        let created_at = self.next_timestamp();
        let id = Uuid::new_v4().to_string();

        let model = messages::ActiveModel {
            id: Set(id.clone()),
            conversation_id: Set(message.conversation_id.clone()),
            sender_id: Set(message.sender_id.clone()),
            content: Set(message.content.clone()),
            kind: Set(message.kind.as_str().to_string()),
            created_at: Set(created_at),
        };
        messages::Entity::insert(model)
            .exec_without_returning(&txn)
            .await?;

        let mut active: conversations::ActiveModel = conv.into();
        active.last_message_id = Set(Some(id.clone()));
        active.updated_at = Set(created_at);
        active.update(&txn).await?;

        // Everyone but the sender gains one unread message
        conversation_participants::Entity::update_many()
            .col_expr(
                conversation_participants::Column::UnreadCount,
                Expr::col(conversation_participants::Column::UnreadCount).add(1),
            )
            .filter(conversation_participants::Column::ConversationId.eq(message.conversation_id.as_str()))
            .filter(conversation_participants::Column::UserId.ne(message.sender_id.as_str()))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        info!("Stored message {} in {}", id, message.conversation_id);

        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            kind: message.kind,
            created_at: from_millis("message.created_at", created_at)?,
        })
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = conversations::Entity::update_many()
            .col_expr(
                conversations::Column::UpdatedAt,
                Expr::value(updated_at.timestamp_millis()),
            )
            .filter(conversations::Column::Id.eq(conversation_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(())
    }

    async fn find_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let wanted: BTreeSet<&str> = participant_ids.iter().map(String::as_str).collect();
        let Some(first) = wanted.iter().next() else {
            return Ok(None);
        };

        let candidates = self.conversation_ids_for_user(first).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut members: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in self.participant_rows(&candidates).await? {
            members
                .entry(row.conversation_id)
                .or_default()
                .insert(row.user_id);
        }

        let convs = conversations::Entity::find()
            .filter(conversations::Column::Id.is_in(candidates))
            .order_by_desc(conversations::Column::UpdatedAt)
            .all(&self.db)
            .await?;

        Ok(convs
            .into_iter()
            .find(|conv| {
                conv.booking_request_id.as_deref() == booking_request_id
                    && members.get(&conv.id).is_some_and(|m| {
                        m.len() == wanted.len() && m.iter().all(|u| wanted.contains(u.as_str()))
                    })
            })
            .map(|conv| conv.id))
    }

    #[instrument(skip(self))]
    async fn create_conversation(
        &self,
        participant_ids: &[String],
        booking_request_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut seen = BTreeSet::new();
        let participants: Vec<&String> = participant_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .collect();
        if participants.is_empty() {
            return Err(StoreError::Validation(
                "a conversation needs at least one participant".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = self.next_timestamp();

        let txn = self.db.begin().await?;

        conversations::Entity::insert(conversations::ActiveModel {
            id: Set(id.clone()),
            booking_request_id: Set(booking_request_id.map(str::to_string)),
            last_message_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .exec_without_returning(&txn)
        .await?;

        for user_id in participants {
            conversation_participants::Entity::insert(conversation_participants::ActiveModel {
                conversation_id: Set(id.clone()),
                user_id: Set(user_id.clone()),
                unread_count: Set(0),
                last_read_at: Set(None),
                joined_at: Set(now),
            })
            .exec_without_returning(&txn)
            .await?;
        }

        txn.commit().await?;

        info!("Created conversation {}", id);
        Ok(id)
    }
}

fn from_millis(field: &'static str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| StoreError::InvalidValue {
        field,
        value: millis.to_string(),
    })
}
