//! Consumer group cache entries
//!
//! A [`GroupMetadata`] is one entry of the group metadata cache. Members are
//! held by id inside the group; there are no back-pointers, and every state
//! read or transition goes through the entry's own lock via
//! [`GroupMetadata::in_lock`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

use crate::types::{OffsetAndMetadata, TopicPartition};

/// Consumer group state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GroupState {
    /// Group has no members
    Empty,
    /// Group is preparing to rebalance
    PreparingRebalance,
    /// Group is waiting on the leader's assignment
    CompletingRebalance,
    /// Group is stable and consuming
    Stable,
    /// Group is dead (tombstoned or unloaded)
    Dead,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupState::Empty => "Empty",
            GroupState::PreparingRebalance => "PreparingRebalance",
            GroupState::CompletingRebalance => "CompletingRebalance",
            GroupState::Stable => "Stable",
            GroupState::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// One member of a consumer group, referenced by id from the group entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberMetadata {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub rebalance_timeout_ms: i32,
    pub session_timeout_ms: i32,
    /// Client-provided subscription metadata, opaque to the coordinator.
    pub subscription: Bytes,
    /// Leader-assigned partitions, opaque to the coordinator.
    pub assignment: Bytes,
}

/// Mutable state of a group entry. All access goes through
/// [`GroupMetadata::in_lock`].
#[derive(Debug)]
pub struct GroupInner {
    pub generation_id: i32,
    pub protocol_type: Option<String>,
    pub protocol: Option<String>,
    pub leader: Option<String>,
    pub state: GroupState,
    pub members: HashMap<String, MemberMetadata>,
    pub offsets: HashMap<TopicPartition, OffsetAndMetadata>,
}

/// One entry of the group metadata cache.
pub struct GroupMetadata {
    group_id: String,
    inner: Mutex<GroupInner>,
}

impl GroupMetadata {
    pub fn new(group_id: impl Into<String>, state: GroupState) -> Self {
        Self {
            group_id: group_id.into(),
            inner: Mutex::new(GroupInner {
                generation_id: 0,
                protocol_type: None,
                protocol: None,
                leader: None,
                state,
                members: HashMap::new(),
                offsets: HashMap::new(),
            }),
        }
    }

    /// Rebuild an entry from a decoded log record. Groups with members come
    /// back `Stable`; member-less groups exist only to carry offsets and come
    /// back `Empty`.
    pub fn loaded(
        group_id: impl Into<String>,
        generation_id: i32,
        protocol_type: Option<String>,
        protocol: Option<String>,
        leader: Option<String>,
        members: Vec<MemberMetadata>,
    ) -> Self {
        let state = if members.is_empty() {
            GroupState::Empty
        } else {
            GroupState::Stable
        };
        Self {
            group_id: group_id.into(),
            inner: Mutex::new(GroupInner {
                generation_id,
                protocol_type,
                protocol,
                leader,
                state,
                members: members
                    .into_iter()
                    .map(|m| (m.member_id.clone(), m))
                    .collect(),
                offsets: HashMap::new(),
            }),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Run `f` under this entry's lock.
    pub fn in_lock<T>(&self, f: impl FnOnce(&mut GroupInner) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    pub fn is(&self, state: GroupState) -> bool {
        self.state() == state
    }

    pub fn generation_id(&self) -> i32 {
        self.inner.lock().generation_id
    }

    pub fn committed_offset(&self, partition: &TopicPartition) -> Option<OffsetAndMetadata> {
        self.inner.lock().offsets.get(partition).cloned()
    }

    /// Apply an acknowledged offset commit in place.
    pub fn on_offset_commit(&self, partition: TopicPartition, offset: OffsetAndMetadata) {
        self.inner.lock().offsets.insert(partition, offset);
    }

    pub fn remove_offset(&self, partition: &TopicPartition) {
        self.inner.lock().offsets.remove(partition);
    }

    pub fn all_offsets(&self) -> HashMap<TopicPartition, OffsetAndMetadata> {
        self.inner.lock().offsets.clone()
    }
}

impl fmt::Debug for GroupMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("GroupMetadata")
            .field("group_id", &self.group_id)
            .field("generation_id", &inner.generation_id)
            .field("state", &inner.state)
            .field("members", &inner.members.len())
            .field("offsets", &inner.offsets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_group_state_depends_on_members() {
        let empty = GroupMetadata::loaded("g", 3, None, None, None, vec![]);
        assert_eq!(empty.state(), GroupState::Empty);

        let member = MemberMetadata {
            member_id: "m1".into(),
            client_id: "c1".into(),
            client_host: "/10.0.0.1".into(),
            rebalance_timeout_ms: 60_000,
            session_timeout_ms: 30_000,
            subscription: Bytes::from_static(b"sub"),
            assignment: Bytes::from_static(b"assign"),
        };
        let stable = GroupMetadata::loaded("g", 3, Some("consumer".into()), None, None, vec![member]);
        assert_eq!(stable.state(), GroupState::Stable);
        assert_eq!(stable.generation_id(), 3);
    }

    #[test]
    fn offset_commits_apply_in_place() {
        let group = GroupMetadata::new("g", GroupState::Empty);
        let tp = TopicPartition::new("orders", 2);
        group.on_offset_commit(tp.clone(), OffsetAndMetadata::new(41, "", 1_000));
        group.on_offset_commit(tp.clone(), OffsetAndMetadata::new(42, "", 2_000));
        assert_eq!(group.committed_offset(&tp).map(|o| o.offset), Some(42));

        group.remove_offset(&tp);
        assert!(group.committed_offset(&tp).is_none());
    }

    #[test]
    fn in_lock_serializes_mutation() {
        let group = GroupMetadata::new("g", GroupState::Empty);
        group.in_lock(|g| {
            g.generation_id = 7;
            g.state = GroupState::Stable;
        });
        assert!(group.is(GroupState::Stable));
        assert_eq!(group.generation_id(), 7);
    }
}
