use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use chrono::Utc;
use murmur_common::types::{ConversationId, MessageId, UserId};
use tokio::sync::RwLock;

use super::{Conversation, ConversationMessage, NewMessage, StartedConversation};

/// In-process chat store used when no database is configured, and by tests.
///
/// Without a seeded user directory every positive user id counts as existing.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
    fail_message_writes: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    known_users: Option<HashSet<UserId>>,
    conversations: BTreeMap<ConversationId, StoredConversation>,
    messages: Vec<ConversationMessage>,
    next_conversation_id: ConversationId,
    next_message_id: MessageId,
    // Monotonic modification counter; wall-clock ties must not reorder listings.
    touch_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredConversation {
    conversation: Conversation,
    touched: u64,
}

impl MemoryChatStore {
    pub fn with_users(users: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                known_users: Some(users.into_iter().collect()),
                ..MemoryState::default()
            }),
            fail_message_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent message write fail.
    pub fn set_fail_message_writes(&self, fail: bool) {
        self.fail_message_writes.store(fail, Ordering::SeqCst);
    }

    pub(super) async fn create_message(&self, message: &NewMessage) -> anyhow::Result<MessageId> {
        if self.fail_message_writes.load(Ordering::SeqCst) {
            bail!("message store unavailable");
        }

        let mut state = self.state.write().await;
        state.touch_seq += 1;
        let touched = state.touch_seq;
        let now = Utc::now();

        let Some(stored) = state.conversations.get_mut(&message.conversation_id) else {
            bail!("conversation {} does not exist", message.conversation_id);
        };
        stored.conversation.modified_at = now;
        stored.touched = touched;

        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.push(ConversationMessage {
            id,
            conversation_id: message.conversation_id,
            body: message.body.clone(),
            sent_to: Some(message.sent_to_id),
            created_by: message.created_by,
            created_at: now,
        });

        Ok(id)
    }

    pub(super) async fn user_exists(&self, user_id: UserId) -> bool {
        match &self.state.read().await.known_users {
            Some(users) => users.contains(&user_id),
            None => user_id > 0,
        }
    }

    pub(super) async fn conversations_for_user(&self, user_id: UserId) -> Vec<Conversation> {
        let state = self.state.read().await;
        let mut matching: Vec<&StoredConversation> = state
            .conversations
            .values()
            .filter(|stored| stored.conversation.users.contains(&user_id))
            .collect();
        matching.sort_by(|left, right| right.touched.cmp(&left.touched));
        matching.into_iter().map(|stored| stored.conversation.clone()).collect()
    }

    pub(super) async fn conversation_for_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Option<Conversation> {
        self.state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .filter(|stored| stored.conversation.users.contains(&user_id))
            .map(|stored| stored.conversation.clone())
    }

    pub(super) async fn messages_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Vec<ConversationMessage> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub(super) async fn start_conversation(
        &self,
        user_id: UserId,
        other_user_id: UserId,
    ) -> StartedConversation {
        let mut state = self.state.write().await;

        let existing = state.conversations.values().find(|stored| {
            stored.conversation.users.contains(&user_id)
                && stored.conversation.users.contains(&other_user_id)
        });
        if let Some(stored) = existing {
            return StartedConversation::Existing(stored.conversation.id);
        }

        state.next_conversation_id += 1;
        state.touch_seq += 1;
        let id = state.next_conversation_id;
        let touched = state.touch_seq;
        let now = Utc::now();
        let mut users = vec![user_id, other_user_id];
        users.sort_unstable();

        state.conversations.insert(
            id,
            StoredConversation {
                conversation: Conversation { id, users, created_at: now, modified_at: now },
                touched,
            },
        );

        StartedConversation::Created(id)
    }
}
