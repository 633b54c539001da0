// Core identity and group-naming types shared by the relay and its clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// Longest room identifier accepted in a connection path.
pub const MAX_ROOM_NAME_LEN: usize = 100;

/// The identity a connection was opened with.
///
/// Authentication happens before the relay sees the connection; the relay only
/// ever receives the resolved principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Principal {
    Anonymous,
    User(UserId),
}

impl Principal {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Anonymous => None,
            Self::User(user_id) => Some(*user_id),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

/// A conversation room identifier taken from the connection path.
///
/// Accepts 1..=100 characters from `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ROOM_NAME_LEN
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(raw.to_owned()))
        } else {
            Err(ProtocolError::InvalidRoomName(raw.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Name of a broadcast group.
///
/// Rendered as `room:<room>` for conversation rooms and `user:<id>` for
/// per-user notification groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupName {
    Room(RoomName),
    User(UserId),
}

impl GroupName {
    pub const ROOM_PREFIX: &'static str = "room:";
    pub const USER_PREFIX: &'static str = "user:";

    pub fn room(room: RoomName) -> Self {
        Self::Room(room)
    }

    pub fn user(user_id: UserId) -> Self {
        Self::User(user_id)
    }

    /// Short label for logs and metrics ("room" or "user").
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Room(_) => "room",
            Self::User(_) => "user",
        }
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(room) => write!(f, "{}{room}", Self::ROOM_PREFIX),
            Self::User(user_id) => write!(f, "{}{user_id}", Self::USER_PREFIX),
        }
    }
}

impl FromStr for GroupName {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(room) = value.strip_prefix(Self::ROOM_PREFIX) {
            return RoomName::parse(room).map(Self::Room);
        }
        if let Some(user_id) = value.strip_prefix(Self::USER_PREFIX) {
            return user_id
                .parse::<UserId>()
                .map(Self::User)
                .map_err(|_| ProtocolError::InvalidGroupName(value.to_owned()));
        }
        Err(ProtocolError::InvalidGroupName(value.to_owned()))
    }
}
