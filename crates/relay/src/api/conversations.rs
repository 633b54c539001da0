// Conversation directory endpoints: list, detail, start.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use murmur_common::types::{ConversationId, MessageId, UserId};
use serde::Serialize;

use super::{parse_id, ApiError};
use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    store::{ChatStore, Conversation, ConversationMessage, StartedConversation},
};

#[derive(Clone)]
struct ConversationsState {
    store: ChatStore,
}

#[derive(Debug, Serialize)]
struct ConversationSummary {
    id: ConversationId,
    users: Vec<UserId>,
    modified_at: DateTime<Utc>,
}

impl From<Conversation> for ConversationSummary {
    fn from(conversation: Conversation) -> Self {
        Self { id: conversation.id, users: conversation.users, modified_at: conversation.modified_at }
    }
}

#[derive(Debug, Serialize)]
struct ConversationsEnvelope {
    conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
struct MessageView {
    id: MessageId,
    body: String,
    sent_to: Option<UserId>,
    created_by: Option<UserId>,
    created_at: DateTime<Utc>,
}

impl From<ConversationMessage> for MessageView {
    fn from(message: ConversationMessage) -> Self {
        Self {
            id: message.id,
            body: message.body,
            sent_to: message.sent_to,
            created_by: message.created_by,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ConversationDetailEnvelope {
    conversation: Conversation,
    messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
struct StartConversationResponse {
    conversation_id: ConversationId,
}

pub fn router(store: ChatStore, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/{id}", get(get_conversation))
        .route("/v1/conversations/start/{user_id}", post(start_conversation))
        .with_state(ConversationsState { store })
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
}

async fn list_conversations(
    State(state): State<ConversationsState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ConversationsEnvelope>, ApiError> {
    let conversations = state.store.conversations_for_user(user.user_id).await?;

    Ok(Json(ConversationsEnvelope {
        conversations: conversations.into_iter().map(ConversationSummary::from).collect(),
    }))
}

async fn get_conversation(
    State(state): State<ConversationsState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_id): Path<String>,
) -> Result<Json<ConversationDetailEnvelope>, ApiError> {
    let conversation_id = parse_id(&raw_id, "conversation id")?;

    // Non-participants get the same answer as for a missing conversation.
    let conversation = state
        .store
        .conversation_for_participant(conversation_id, user.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    let messages = state.store.messages_for_conversation(conversation_id).await?;

    Ok(Json(ConversationDetailEnvelope {
        conversation,
        messages: messages.into_iter().map(MessageView::from).collect(),
    }))
}

async fn start_conversation(
    State(state): State<ConversationsState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_user_id): Path<String>,
) -> Result<(StatusCode, Json<StartConversationResponse>), ApiError> {
    let other_user_id = parse_id(&raw_user_id, "user id")?;
    if other_user_id == user.user_id {
        return Err(ApiError::bad_request("cannot start a conversation with yourself"));
    }
    if !state.store.user_exists(other_user_id).await? {
        return Err(ApiError::not_found("user not found"));
    }

    let started = state.store.start_conversation(user.user_id, other_user_id).await?;
    let status = match started {
        StartedConversation::Created(_) => StatusCode::CREATED,
        StartedConversation::Existing(_) => StatusCode::OK,
    };
    tracing::debug!(
        user_id = user.user_id,
        other_user_id,
        conversation_id = started.id(),
        created = matches!(started, StartedConversation::Created(_)),
        "conversation resolved"
    );

    Ok((status, Json(StartConversationResponse { conversation_id: started.id() })))
}
