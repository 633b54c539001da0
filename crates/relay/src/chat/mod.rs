// Real-time chat core: sessions, routing and off-path persistence.

pub mod persistence;
pub mod router;
pub mod session;

use std::sync::Arc;

use murmur_common::protocol::chat::OutboundEvent;
use murmur_common::types::{Principal, RoomName};
use tokio::sync::mpsc;

use crate::groups::GroupRegistry;
use persistence::MessageWriter;
use session::ConnectionSession;

/// Shared state every connection task needs to open a session.
#[derive(Clone)]
pub struct ChatHub {
    registry: Arc<GroupRegistry>,
    writer: MessageWriter,
    outbound_buffer: usize,
}

impl ChatHub {
    pub fn new(registry: Arc<GroupRegistry>, writer: MessageWriter, outbound_buffer: usize) -> Self {
        Self { registry, writer, outbound_buffer }
    }

    pub fn open_session(
        &self,
        room: RoomName,
        principal: Principal,
    ) -> (ConnectionSession, mpsc::Receiver<OutboundEvent>) {
        ConnectionSession::open(
            Arc::clone(&self.registry),
            self.writer.clone(),
            room,
            principal,
            self.outbound_buffer,
        )
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }
}
