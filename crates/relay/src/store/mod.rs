// Durable chat storage: conversation directory + message persistence.

mod memory;
mod postgres;

pub use memory::MemoryChatStore;

use chrono::{DateTime, Utc};
use murmur_common::types::{ConversationId, MessageId, UserId};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Participant ids, ascending.
    pub users: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub body: String,
    pub sent_to: Option<UserId>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

/// A chat message waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub body: String,
    pub sent_to_id: UserId,
    /// `None` when the sending connection was anonymous.
    pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartedConversation {
    Existing(ConversationId),
    Created(ConversationId),
}

impl StartedConversation {
    pub fn id(self) -> ConversationId {
        match self {
            Self::Existing(id) | Self::Created(id) => id,
        }
    }
}

#[derive(Clone)]
pub enum ChatStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<MemoryChatStore>),
}

impl ChatStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(MemoryChatStore::default()))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn create_message(&self, message: &NewMessage) -> anyhow::Result<MessageId> {
        match self {
            Self::Postgres(pool) => postgres::create_message(pool, message).await,
            Self::Memory(store) => store.create_message(message).await,
        }
    }

    pub async fn user_exists(&self, user_id: UserId) -> anyhow::Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::user_exists(pool, user_id).await,
            Self::Memory(store) => Ok(store.user_exists(user_id).await),
        }
    }

    /// Conversations `user_id` takes part in, most recently modified first.
    pub async fn conversations_for_user(
        &self,
        user_id: UserId,
    ) -> anyhow::Result<Vec<Conversation>> {
        match self {
            Self::Postgres(pool) => postgres::conversations_for_user(pool, user_id).await,
            Self::Memory(store) => Ok(store.conversations_for_user(user_id).await),
        }
    }

    /// The conversation, if it exists and `user_id` is one of its participants.
    pub async fn conversation_for_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> anyhow::Result<Option<Conversation>> {
        match self {
            Self::Postgres(pool) => {
                postgres::conversation_for_participant(pool, conversation_id, user_id).await
            }
            Self::Memory(store) => {
                Ok(store.conversation_for_participant(conversation_id, user_id).await)
            }
        }
    }

    /// Messages of a conversation, oldest first.
    pub async fn messages_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        match self {
            Self::Postgres(pool) => postgres::messages_for_conversation(pool, conversation_id).await,
            Self::Memory(store) => Ok(store.messages_for_conversation(conversation_id).await),
        }
    }

    /// Find the conversation shared by two users, creating it when none exists.
    pub async fn start_conversation(
        &self,
        user_id: UserId,
        other_user_id: UserId,
    ) -> anyhow::Result<StartedConversation> {
        anyhow::ensure!(user_id != other_user_id, "a conversation needs two distinct users");
        match self {
            Self::Postgres(pool) => postgres::start_conversation(pool, user_id, other_user_id).await,
            Self::Memory(store) => Ok(store.start_conversation(user_id, other_user_id).await),
        }
    }
}
