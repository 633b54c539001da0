// Process-wide group registry: group name -> live sessions subscribed to it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use dashmap::DashMap;
use murmur_common::protocol::chat::OutboundEvent;
use murmur_common::types::GroupName;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type OutboundSender = mpsc::Sender<OutboundEvent>;

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Members whose outbound queue was full.
    pub dropped: usize,
    /// Members whose connection already went away.
    pub closed: usize,
}

/// Membership is sharded by group, so broadcasts to different groups never
/// contend on the same lock.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: DashMap<GroupName, HashMap<SessionId, OutboundSender>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a group, creating the group on first join.
    ///
    /// Returns `false` when the session was already a member; the original
    /// sender is kept in that case.
    pub fn join(&self, group: &GroupName, session_id: SessionId, sender: OutboundSender) -> bool {
        let mut members = self.groups.entry(group.clone()).or_default();
        match members.entry(session_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(sender);
                true
            }
        }
    }

    /// Remove a session from a group. Unknown groups and non-members are no-ops.
    pub fn leave(&self, group: &GroupName, session_id: SessionId) -> bool {
        let removed = {
            let Some(mut members) = self.groups.get_mut(group) else {
                return false;
            };
            members.remove(&session_id).is_some()
        };

        // The shard guard above must be released before this call.
        self.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }

    /// Hand `event` to every current member without waiting on any of them.
    ///
    /// Members are snapshotted first so a slow or vanished session never holds
    /// the group's shard while the rest are served.
    pub fn broadcast(&self, group: &GroupName, event: &OutboundEvent) -> BroadcastReport {
        let recipients: Vec<(SessionId, OutboundSender)> = match self.groups.get(group) {
            Some(members) => {
                members.iter().map(|(session_id, sender)| (*session_id, sender.clone())).collect()
            }
            None => return BroadcastReport::default(),
        };

        let mut report = BroadcastReport::default();
        for (session_id, sender) in recipients {
            match sender.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(
                        session_id = %session_id,
                        group = %group,
                        event = event.kind(),
                        "outbound queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => report.closed += 1,
            }
        }

        report
    }

    pub fn member_count(&self, group: &GroupName) -> usize {
        self.groups.get(group).map_or(0, |members| members.len())
    }

    pub fn is_member(&self, group: &GroupName, session_id: SessionId) -> bool {
        self.groups.get(group).is_some_and(|members| members.contains_key(&session_id))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
