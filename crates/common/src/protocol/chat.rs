// Chat WebSocket events.
//
// Inbound frames are `{ "event": <kind>, "data": { ... } }`. Outbound frames are
// flat: `{ "event": <kind>, ...fields }`.

use serde::{Deserialize, Deserializer, Serialize};

use super::ProtocolError;
use crate::types::{ConversationId, UserId};

pub const CHAT_MESSAGE_EVENT: &str = "chat_message";
pub const TYPING_EVENT: &str = "typing";
pub const NEW_MESSAGE_NOTIFICATION_EVENT: &str = "new_message_notification";

/// Payload of an inbound `chat_message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub conversation_id: ConversationId,
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub sent_to_id: UserId,
    /// Display name of the sender.
    pub name: String,
    pub body: String,
}

/// Payload of an inbound `typing` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub name: String,
}

/// A decoded client event.
///
/// Discriminators this relay does not know decode to [`InboundEvent::Unrecognized`]
/// instead of failing, so newer clients can talk to older relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ChatMessage(ChatMessagePayload),
    Typing(TypingPayload),
    Unrecognized { event: String },
}

#[derive(Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl InboundEvent {
    /// Decode a text frame.
    ///
    /// Fails when the frame is not a JSON object with a string `event` field, or
    /// when a known event carries a payload missing required fields.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let InboundEnvelope { event, data } = serde_json::from_str(raw)?;

        match event.as_str() {
            CHAT_MESSAGE_EVENT => serde_json::from_value(data)
                .map(Self::ChatMessage)
                .map_err(|source| ProtocolError::InvalidPayload { event, source }),
            TYPING_EVENT => serde_json::from_value(data)
                .map(Self::Typing)
                .map_err(|source| ProtocolError::InvalidPayload { event, source }),
            _ => Ok(Self::Unrecognized { event }),
        }
    }

    /// Event kind label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage(_) => CHAT_MESSAGE_EVENT,
            Self::Typing(_) => TYPING_EVENT,
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// An event pushed from the relay to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// A chat message shown in the conversation view.
    ChatMessage { body: String, name: String },
    /// Someone in the room is typing.
    #[serde(rename = "typing")]
    UserTyping { name: String },
    /// Sent to every connection of the recipient user.
    NewMessageNotification { message: String, from_user: String },
}

impl OutboundEvent {
    pub fn new_message_notification(from_user: &str) -> Self {
        Self::NewMessageNotification {
            message: format!("New message from {from_user}"),
            from_user: from_user.to_owned(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => CHAT_MESSAGE_EVENT,
            Self::UserTyping { .. } => TYPING_EVENT,
            Self::NewMessageNotification { .. } => NEW_MESSAGE_NOTIFICATION_EVENT,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(i64),
    Text(String),
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(id) => Ok(id),
        IdRepr::Text(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("expected integer id, got {raw:?}"))),
    }
}
