use std::sync::Arc;

use murmur_common::protocol::chat::{InboundEvent, OutboundEvent};
use murmur_common::types::{GroupName, Principal, RoomName};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use super::persistence::MessageWriter;
use super::router::{route, SessionIdentity};
use crate::groups::{GroupRegistry, SessionId};
use crate::metrics;

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Routed { event: &'static str, delivered: usize, dropped: usize, persist_queued: bool },
    Ignored { event: String },
    Malformed,
}

/// One client's membership in the registry.
///
/// Leaves every joined group on [`ConnectionSession::close`] or when dropped.
pub struct ConnectionSession {
    id: SessionId,
    identity: SessionIdentity,
    joined: Vec<GroupName>,
    registry: Arc<GroupRegistry>,
    writer: MessageWriter,
}

impl ConnectionSession {
    /// Join the room group and, for an authenticated principal, the user group.
    ///
    /// Returns the session and the receiving end of its outbound queue.
    pub fn open(
        registry: Arc<GroupRegistry>,
        writer: MessageWriter,
        room: RoomName,
        principal: Principal,
        outbound_buffer: usize,
    ) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (sender, receiver) = mpsc::channel(outbound_buffer.max(1));
        let id = Uuid::new_v4();
        let room_group = GroupName::room(room);

        let mut joined = vec![room_group.clone()];
        if let Some(user_id) = principal.user_id() {
            joined.push(GroupName::user(user_id));
        }
        for group in &joined {
            registry.join(group, id, sender.clone());
        }

        debug!(
            session_id = %id,
            room = %room_group,
            user_id = principal.user_id(),
            "chat session opened"
        );

        let session = Self {
            id,
            identity: SessionIdentity { room_group, principal },
            joined,
            registry,
            writer,
        };
        (session, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn principal(&self) -> Principal {
        self.identity.principal
    }

    pub fn joined_groups(&self) -> &[GroupName] {
        &self.joined
    }

    /// Decode a text frame and dispatch it. Undecodable frames are dropped.
    pub fn receive(&self, raw: &str) -> ReceiveOutcome {
        match InboundEvent::parse(raw) {
            Ok(event) => self.dispatch(event),
            Err(parse_error) => {
                metrics::record_malformed_frame();
                debug!(session_id = %self.id, error = %parse_error, "dropping malformed chat frame");
                ReceiveOutcome::Malformed
            }
        }
    }

    /// Broadcast first, then hand any write to the persistence queue.
    pub fn dispatch(&self, event: InboundEvent) -> ReceiveOutcome {
        if let InboundEvent::Unrecognized { event } = &event {
            debug!(session_id = %self.id, event = %event, "ignoring unrecognized chat event");
            return ReceiveOutcome::Ignored { event: event.clone() };
        }
        let kind = event.kind();
        metrics::record_ws_event(kind);

        let plan = route(&self.identity, event);
        let (mut delivered, mut dropped) = (0, 0);
        for (group, outbound) in &plan.broadcasts {
            let report = self.registry.broadcast(group, outbound);
            metrics::record_broadcast(group.kind(), report.delivered, report.dropped);
            delivered += report.delivered;
            dropped += report.dropped;
        }

        let persist_queued = match plan.persist {
            Some(message) => {
                let conversation_id = message.conversation_id;
                let queued = self.writer.submit(message);
                if !queued {
                    metrics::record_persistence(false);
                    error!(
                        session_id = %self.id,
                        conversation_id,
                        "message writer is gone, chat message not stored"
                    );
                }
                queued
            }
            None => false,
        };

        ReceiveOutcome::Routed { event: kind, delivered, dropped, persist_queued }
    }

    /// Leave every joined group. Safe to call more than once.
    pub fn close(&mut self) {
        if self.joined.is_empty() {
            return;
        }
        for group in self.joined.drain(..) {
            self.registry.leave(&group, self.id);
        }
        debug!(session_id = %self.id, "chat session closed");
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::persistence::WriterHandle;
    use crate::store::{ChatStore, MemoryChatStore};
    use std::time::Duration;

    const ALICE_SAYS_HI: &str = r#"{"event":"chat_message","data":{"conversation_id":42,"sent_to_id":7,"name":"Alice","body":"hi"}}"#;

    struct Harness {
        registry: Arc<GroupRegistry>,
        writer: MessageWriter,
        writer_handle: Option<WriterHandle>,
        memory: Arc<MemoryChatStore>,
        store: ChatStore,
    }

    impl Harness {
        async fn new() -> Self {
            let memory = Arc::new(MemoryChatStore::default());
            let store = ChatStore::Memory(Arc::clone(&memory));
            // Conversation ids are sequential from 1; create up to 42.
            for other in 2..=43 {
                store.start_conversation(1, other).await.expect("seed conversation");
            }
            let (writer, writer_handle) = MessageWriter::spawn(store.clone());
            Self {
                registry: Arc::new(GroupRegistry::new()),
                writer,
                writer_handle: Some(writer_handle),
                memory,
                store,
            }
        }

        /// Wait until every queued write has been attempted.
        async fn drain_writes(&mut self) {
            let handle = self.writer_handle.take().expect("writer already drained");
            assert!(handle.shutdown(Duration::from_secs(2)).await, "writer should drain");
        }

        fn open(
            &self,
            room: &str,
            principal: Principal,
            buffer: usize,
        ) -> (ConnectionSession, mpsc::Receiver<OutboundEvent>) {
            ConnectionSession::open(
                Arc::clone(&self.registry),
                self.writer.clone(),
                RoomName::parse(room).expect("valid room"),
                principal,
                buffer,
            )
        }

        async fn stored_bodies(&self, conversation_id: i64) -> Vec<String> {
            for _ in 0..50 {
                let stored = self
                    .store
                    .messages_for_conversation(conversation_id)
                    .await
                    .expect("messages should load");
                if !stored.is_empty() {
                    return stored.into_iter().map(|message| message.body).collect();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Vec::new()
        }
    }

    fn room_group(room: &str) -> GroupName {
        GroupName::room(RoomName::parse(room).expect("valid room"))
    }

    #[tokio::test]
    async fn open_joins_room_and_user_groups() {
        let harness = Harness::new().await;
        let (session, _receiver) = harness.open("42", Principal::User(7), 8);

        assert_eq!(session.joined_groups(), &[room_group("42"), GroupName::user(7)]);
        assert!(harness.registry.is_member(&room_group("42"), session.id()));
        assert!(harness.registry.is_member(&GroupName::user(7), session.id()));
    }

    #[tokio::test]
    async fn anonymous_session_only_joins_the_room() {
        let harness = Harness::new().await;
        let (session, _receiver) = harness.open("42", Principal::Anonymous, 8);

        assert_eq!(session.joined_groups(), &[room_group("42")]);
        assert_eq!(harness.registry.group_count(), 1);
    }

    #[tokio::test]
    async fn chat_message_reaches_room_and_recipient_and_is_stored() {
        let harness = Harness::new().await;
        let (alice, mut alice_rx) = harness.open("42", Principal::User(3), 8);
        let (_bob, mut bob_rx) = harness.open("42", Principal::Anonymous, 8);
        let (_recipient, mut recipient_rx) = harness.open("lobby", Principal::User(7), 8);

        let outcome = alice.receive(ALICE_SAYS_HI);
        assert_eq!(
            outcome,
            ReceiveOutcome::Routed {
                event: "chat_message",
                delivered: 3,
                dropped: 0,
                persist_queued: true
            }
        );

        let expected = OutboundEvent::ChatMessage { body: "hi".into(), name: "Alice".into() };
        assert_eq!(alice_rx.recv().await, Some(expected.clone()));
        assert_eq!(bob_rx.recv().await, Some(expected));
        assert_eq!(
            recipient_rx.recv().await,
            Some(OutboundEvent::NewMessageNotification {
                message: "New message from Alice".into(),
                from_user: "Alice".into(),
            })
        );
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
        assert!(recipient_rx.try_recv().is_err());

        assert_eq!(harness.stored_bodies(42).await, vec!["hi"]);
    }

    #[tokio::test]
    async fn notification_goes_to_every_session_of_the_recipient() {
        let harness = Harness::new().await;
        let (alice, _alice_rx) = harness.open("42", Principal::User(3), 8);
        let (_phone, mut phone_rx) = harness.open("lobby", Principal::User(7), 8);
        let (_laptop, mut laptop_rx) = harness.open("other", Principal::User(7), 8);

        alice.receive(ALICE_SAYS_HI);

        for receiver in [&mut phone_rx, &mut laptop_rx] {
            assert!(matches!(
                receiver.recv().await,
                Some(OutboundEvent::NewMessageNotification { .. })
            ));
        }
    }

    #[tokio::test]
    async fn offline_recipient_is_not_an_error() {
        let harness = Harness::new().await;
        let (alice, mut alice_rx) = harness.open("42", Principal::User(3), 8);

        let outcome = alice.receive(ALICE_SAYS_HI);
        assert!(matches!(outcome, ReceiveOutcome::Routed { delivered: 1, .. }));
        assert!(alice_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn typing_reaches_only_room_members() {
        let harness = Harness::new().await;
        let (alice, mut alice_rx) = harness.open("42", Principal::User(3), 8);
        let (_bob, mut bob_rx) = harness.open("42", Principal::User(7), 8);
        let (_elsewhere, mut elsewhere_rx) = harness.open("lobby", Principal::User(7), 8);

        let outcome = alice.receive(r#"{"event":"typing","data":{"name":"Alice"}}"#);
        assert_eq!(
            outcome,
            ReceiveOutcome::Routed { event: "typing", delivered: 2, dropped: 0, persist_queued: false }
        );

        let expected = OutboundEvent::UserTyping { name: "Alice".into() };
        assert_eq!(alice_rx.recv().await, Some(expected.clone()));
        assert_eq!(bob_rx.recv().await, Some(expected));
        assert!(bob_rx.try_recv().is_err());
        assert!(elsewhere_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_produce_nothing() {
        let harness = Harness::new().await;
        let (alice, mut alice_rx) = harness.open("42", Principal::User(3), 8);
        let (_bob, mut bob_rx) = harness.open("42", Principal::User(7), 8);

        assert_eq!(
            alice.receive(r#"{"event":"read_receipt","data":{}}"#),
            ReceiveOutcome::Ignored { event: "read_receipt".into() }
        );
        for raw in [
            "not json",
            r#"{"data":{"name":"Alice"}}"#,
            r#"{"event":"chat_message","data":{"name":"Alice"}}"#,
            r#"{"event":"typing"}"#,
        ] {
            assert_eq!(alice.receive(raw), ReceiveOutcome::Malformed, "frame: {raw}");
        }

        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(harness.store.messages_for_conversation(42).await.expect("messages").is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_broadcasts_skip_closed_sessions() {
        let harness = Harness::new().await;
        let (alice, _alice_rx) = harness.open("42", Principal::User(3), 8);
        let (mut bob, mut bob_rx) = harness.open("42", Principal::User(7), 8);

        bob.close();
        bob.close();
        assert!(!harness.registry.is_member(&GroupName::user(7), bob.id()));

        let outcome = alice.receive(ALICE_SAYS_HI);
        assert!(matches!(outcome, ReceiveOutcome::Routed { delivered: 1, dropped: 0, .. }));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_a_session_leaves_its_groups() {
        let harness = Harness::new().await;
        let (session, _receiver) = harness.open("42", Principal::User(7), 8);
        drop(session);

        assert_eq!(harness.registry.group_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_misses_events_without_stalling_others() {
        let harness = Harness::new().await;
        let (alice, mut alice_rx) = harness.open("42", Principal::User(3), 16);
        let (_slow, mut slow_rx) = harness.open("42", Principal::Anonymous, 1);

        alice.receive(r#"{"event":"typing","data":{"name":"one"}}"#);
        let outcome = alice.receive(r#"{"event":"typing","data":{"name":"two"}}"#);
        assert!(matches!(outcome, ReceiveOutcome::Routed { delivered: 1, dropped: 1, .. }));

        assert_eq!(slow_rx.recv().await, Some(OutboundEvent::UserTyping { name: "one".into() }));
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(alice_rx.recv().await, Some(OutboundEvent::UserTyping { name: "one".into() }));
        assert_eq!(alice_rx.recv().await, Some(OutboundEvent::UserTyping { name: "two".into() }));
    }

    #[tokio::test]
    async fn failed_write_still_delivers_and_is_not_reported_to_anyone() {
        let mut harness = Harness::new().await;
        harness.memory.set_fail_message_writes(true);
        let (alice, mut alice_rx) = harness.open("42", Principal::User(3), 8);
        let (_bob, mut bob_rx) = harness.open("42", Principal::Anonymous, 8);
        let (_recipient, mut recipient_rx) = harness.open("lobby", Principal::User(7), 8);

        let outcome = alice.receive(ALICE_SAYS_HI);
        assert!(matches!(outcome, ReceiveOutcome::Routed { delivered: 3, persist_queued: true, .. }));

        // The session keeps working after the write failed.
        alice.receive(r#"{"event":"typing","data":{"name":"Alice"}}"#);
        harness.drain_writes().await;

        let chat = OutboundEvent::ChatMessage { body: "hi".into(), name: "Alice".into() };
        let typing = OutboundEvent::UserTyping { name: "Alice".into() };
        for receiver in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(receiver.recv().await, Some(chat.clone()));
            assert_eq!(receiver.recv().await, Some(typing.clone()));
            assert!(receiver.try_recv().is_err());
        }
        assert_eq!(
            recipient_rx.recv().await,
            Some(OutboundEvent::new_message_notification("Alice"))
        );
        assert!(recipient_rx.try_recv().is_err());

        assert!(harness.store.messages_for_conversation(42).await.expect("messages").is_empty());
    }
}
