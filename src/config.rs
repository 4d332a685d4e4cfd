//! Injected configuration for the coordinator managers
//!
//! Both managers receive their configuration at construction time; there is
//! no process-wide state and no CLI or environment parsing here.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default topic holding group metadata and committed offsets.
pub const GROUP_METADATA_TOPIC_NAME: &str = "__consumer_offsets";

/// Default topic holding transaction metadata.
pub const TRANSACTION_STATE_TOPIC_NAME: &str = "__transaction_state";

/// Configuration for the group metadata manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetConfig {
    /// Topic the group metadata log lives on.
    pub offsets_topic_name: String,
    /// Fixed partition count of the group metadata topic. Routing depends on
    /// this value staying identical across all brokers.
    pub offsets_topic_num_partitions: i32,
    /// Maximum size of the metadata string attached to an offset commit.
    pub max_metadata_size: usize,
    /// Timeout applied to every bus append and read.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            offsets_topic_name: GROUP_METADATA_TOPIC_NAME.to_string(),
            offsets_topic_num_partitions: 50,
            max_metadata_size: 4096,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the transaction state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Topic the transaction metadata log lives on.
    pub transaction_metadata_topic_name: String,
    /// Fixed partition count of the transaction metadata topic.
    pub transaction_log_num_partitions: i32,
    /// Upper bound accepted for client-requested transaction timeouts.
    pub transaction_max_timeout_ms: i32,
    /// Timeout applied to every bus append and read.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            transaction_metadata_topic_name: TRANSACTION_STATE_TOPIC_NAME.to_string(),
            transaction_log_num_partitions: 50,
            transaction_max_timeout_ms: 900_000,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let offsets = OffsetConfig::default();
        assert_eq!(offsets.offsets_topic_name, "__consumer_offsets");
        assert_eq!(offsets.offsets_topic_num_partitions, 50);

        let txn = TransactionConfig::default();
        assert_eq!(txn.transaction_metadata_topic_name, "__transaction_state");
        assert_eq!(txn.transaction_max_timeout_ms, 900_000);
    }
}
