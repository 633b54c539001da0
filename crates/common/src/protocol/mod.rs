pub mod chat;

use thiserror::Error;

/// Failures decoding client frames or connection parameters.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed event frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid `{event}` payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid room name {0:?}")]
    InvalidRoomName(String),

    #[error("invalid group name {0:?}")]
    InvalidGroupName(String),
}
