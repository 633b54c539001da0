use anyhow::Context;
use chrono::{DateTime, Utc};
use murmur_common::types::{ConversationId, MessageId, UserId};
use sqlx::PgPool;

use super::{Conversation, ConversationMessage, NewMessage, StartedConversation};

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    id: i64,
    users: Vec<i64>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self { id: row.id, users: row.users, created_at: row.created_at, modified_at: row.modified_at }
    }
}

pub(super) async fn create_message(pool: &PgPool, message: &NewMessage) -> anyhow::Result<MessageId> {
    let mut tx = pool.begin().await.context("failed to open message transaction")?;

    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO conversation_messages (conversation_id, body, sent_to_id, created_by_id)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(message.conversation_id)
    .bind(&message.body)
    .bind(message.sent_to_id)
    .bind(message.created_by)
    .fetch_one(&mut *tx)
    .await
    .with_context(|| {
        format!("failed to insert message into conversation {}", message.conversation_id)
    })?;

    sqlx::query("UPDATE conversations SET modified_at = now() WHERE id = $1")
        .bind(message.conversation_id)
        .execute(&mut *tx)
        .await
        .context("failed to touch conversation modified_at")?;

    tx.commit().await.context("failed to commit message transaction")?;
    Ok(id)
}

pub(super) async fn user_exists(pool: &PgPool, user_id: UserId) -> anyhow::Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .context("failed to look up user")
}

pub(super) async fn conversations_for_user(
    pool: &PgPool,
    user_id: UserId,
) -> anyhow::Result<Vec<Conversation>> {
    let rows = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT c.id,
               array_agg(p.user_id ORDER BY p.user_id) AS users,
               c.created_at,
               c.modified_at
        FROM conversations AS c
        INNER JOIN conversation_participants AS p
            ON p.conversation_id = c.id
        WHERE c.id IN (
            SELECT conversation_id FROM conversation_participants WHERE user_id = $1
        )
        GROUP BY c.id
        ORDER BY c.modified_at DESC, c.id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list conversations for user")?;

    Ok(rows.into_iter().map(Conversation::from).collect())
}

pub(super) async fn conversation_for_participant(
    pool: &PgPool,
    conversation_id: ConversationId,
    user_id: UserId,
) -> anyhow::Result<Option<Conversation>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT c.id,
               array_agg(p.user_id ORDER BY p.user_id) AS users,
               c.created_at,
               c.modified_at
        FROM conversations AS c
        INNER JOIN conversation_participants AS p
            ON p.conversation_id = c.id
        WHERE c.id = $1
          AND EXISTS (
              SELECT 1 FROM conversation_participants
              WHERE conversation_id = $1 AND user_id = $2
          )
        GROUP BY c.id
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to load conversation")?;

    Ok(row.map(Conversation::from))
}

pub(super) async fn messages_for_conversation(
    pool: &PgPool,
    conversation_id: ConversationId,
) -> anyhow::Result<Vec<ConversationMessage>> {
    sqlx::query_as::<_, ConversationMessage>(
        r#"
        SELECT id,
               conversation_id,
               body,
               sent_to_id AS sent_to,
               created_by_id AS created_by,
               created_at
        FROM conversation_messages
        WHERE conversation_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .context("failed to load conversation messages")
}

pub(super) async fn start_conversation(
    pool: &PgPool,
    user_id: UserId,
    other_user_id: UserId,
) -> anyhow::Result<StartedConversation> {
    let (low, high) = (user_id.min(other_user_id), user_id.max(other_user_id));
    let mut tx = pool.begin().await.context("failed to open conversation transaction")?;

    // Serialize concurrent starts for the same pair so only one conversation is created.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("conversation:{low}:{high}"))
        .execute(&mut *tx)
        .await
        .context("failed to lock conversation pair")?;

    let existing = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT a.conversation_id
        FROM conversation_participants AS a
        INNER JOIN conversation_participants AS b
            ON b.conversation_id = a.conversation_id
        WHERE a.user_id = $1
          AND b.user_id = $2
        ORDER BY a.conversation_id
        LIMIT 1
        "#,
    )
    .bind(low)
    .bind(high)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to look up shared conversation")?;

    if let Some(conversation_id) = existing {
        tx.commit().await.context("failed to release conversation lock")?;
        return Ok(StartedConversation::Existing(conversation_id));
    }

    let conversation_id =
        sqlx::query_scalar::<_, i64>("INSERT INTO conversations DEFAULT VALUES RETURNING id")
            .fetch_one(&mut *tx)
            .await
            .context("failed to create conversation")?;

    sqlx::query(
        "INSERT INTO conversation_participants (conversation_id, user_id) VALUES ($1, $2), ($1, $3)",
    )
    .bind(conversation_id)
    .bind(low)
    .bind(high)
    .execute(&mut *tx)
    .await
    .context("failed to add conversation participants")?;

    tx.commit().await.context("failed to commit conversation")?;
    Ok(StartedConversation::Created(conversation_id))
}
