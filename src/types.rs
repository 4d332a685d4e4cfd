//! Shared identifier types for the coordinator managers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Producer id sentinel for non-transactional offset commits.
pub const NO_PRODUCER_ID: i64 = -1;

/// Producer epoch sentinel for non-transactional offset commits.
pub const NO_PRODUCER_EPOCH: i16 = -1;

/// A topic and partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A committed offset for one topic partition within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: String,
    pub commit_timestamp: i64,
    pub expire_timestamp: i64,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64, metadata: impl Into<String>, commit_timestamp: i64) -> Self {
        Self {
            offset,
            metadata: metadata.into(),
            commit_timestamp,
            expire_timestamp: -1,
        }
    }
}

/// Index key for a committed offset while it is staged during partition load.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupTopicPartition {
    pub group: String,
    pub topic_partition: TopicPartition,
}

impl GroupTopicPartition {
    pub fn new(group: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            group: group.into(),
            topic_partition: TopicPartition::new(topic, partition),
        }
    }
}

impl fmt::Display for GroupTopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}]",
            self.group, self.topic_partition.topic, self.topic_partition.partition
        )
    }
}
