use murmur_common::protocol::chat::{InboundEvent, OutboundEvent};
use murmur_common::types::{GroupName, Principal};

use crate::store::NewMessage;

/// Who sent an event and which room they are connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub room_group: GroupName,
    pub principal: Principal,
}

/// What one inbound event turns into. Built without touching the registry or
/// the store, then executed by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePlan {
    /// Executed in order.
    pub broadcasts: Vec<(GroupName, OutboundEvent)>,
    pub persist: Option<NewMessage>,
}

impl RoutePlan {
    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty() && self.persist.is_none()
    }
}

pub fn route(identity: &SessionIdentity, event: InboundEvent) -> RoutePlan {
    match event {
        InboundEvent::ChatMessage(payload) => {
            let notification = OutboundEvent::new_message_notification(&payload.name);
            let persist = NewMessage {
                conversation_id: payload.conversation_id,
                body: payload.body.clone(),
                sent_to_id: payload.sent_to_id,
                created_by: identity.principal.user_id(),
            };

            RoutePlan {
                broadcasts: vec![
                    (
                        identity.room_group.clone(),
                        OutboundEvent::ChatMessage { body: payload.body, name: payload.name },
                    ),
                    (GroupName::user(payload.sent_to_id), notification),
                ],
                persist: Some(persist),
            }
        }
        InboundEvent::Typing(payload) => RoutePlan {
            broadcasts: vec![(
                identity.room_group.clone(),
                OutboundEvent::UserTyping { name: payload.name },
            )],
            persist: None,
        },
        InboundEvent::Unrecognized { .. } => RoutePlan::default(),
    }
}
