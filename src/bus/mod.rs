//! Log-bus contract and per-partition gateway
//!
//! The underlying message bus is an external collaborator; this module owns
//! only the trait surface the coordinator managers depend on, plus:
//!
//! - [`gateway::LogGateway`]: lazy per-partition producer/reader handles
//! - [`memory::MemoryBus`]: an in-memory bus for embedded use and tests

pub mod gateway;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use gateway::LogGateway;
pub use memory::MemoryBus;

/// Identifier of a durably appended message. Totally ordered within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
}

impl MessageId {
    pub fn new(ledger_id: u64, entry_id: u64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger_id, self.entry_id)
    }
}

/// A message handed back by a reader.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: MessageId,
    /// Records without a key are placeholders and are skipped during load.
    pub key_bytes: Option<Bytes>,
    pub value: Bytes,
    pub event_time: i64,
}

impl BusMessage {
    pub fn has_key(&self) -> bool {
        self.key_bytes.is_some()
    }
}

/// Where a newly created reader starts consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

/// Failure categories reported by the bus transport.
///
/// The append pipeline translates these into coordinator errors; the
/// categories mirror the produce-path statuses of the Kafka log layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("not enough replicas to acknowledge the append")]
    NotEnoughReplicas,

    #[error("bus operation timed out")]
    OperationTimedOut,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("message too large: {size} bytes")]
    MessageTooLarge { size: usize },

    #[error("record batch too large")]
    RecordListTooLarge,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Factory for per-topic producer and reader handles.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn new_producer(&self, topic: &str) -> Result<Arc<dyn BusProducer>, BusError>;

    async fn new_reader(
        &self,
        topic: &str,
        start: StartPosition,
        read_compacted: bool,
    ) -> Result<Arc<dyn BusReader>, BusError>;
}

/// A producer handle bound to one topic.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Append one record. Resolves once the bus has acknowledged durability.
    async fn send(
        &self,
        key_bytes: Option<Bytes>,
        value: Bytes,
        event_time: i64,
    ) -> Result<MessageId, BusError>;

    async fn close(&self) -> Result<(), BusError>;

    fn topic(&self) -> &str;
}

/// A reader handle bound to one topic.
#[async_trait]
pub trait BusReader: Send + Sync {
    /// Read the next message, waiting until one is available.
    async fn read_next(&self) -> Result<BusMessage, BusError>;

    async fn close(&self) -> Result<(), BusError>;

    fn topic(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_totally_ordered() {
        let a = MessageId::new(1, 5);
        let b = MessageId::new(1, 6);
        let c = MessageId::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, MessageId::new(1, 5));
    }
}
