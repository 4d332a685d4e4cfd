//! Per-partition gateway onto the log bus
//!
//! Producer and reader handles are created lazily on first use against the
//! `<topic>-partition-<n>` naming scheme and cached until the partition is
//! unloaded. Readers always start at the earliest message and consume the
//! compacted view of the partition.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::bus::{BusError, BusMessage, BusProducer, BusReader, MessageBus, MessageId, StartPosition};

/// Lazy per-partition producer/reader handles for one metadata topic.
pub struct LogGateway {
    bus: Arc<dyn MessageBus>,
    topic_name: String,
    operation_timeout: Duration,
    producers: Mutex<HashMap<i32, Arc<dyn BusProducer>>>,
    readers: Mutex<HashMap<i32, Arc<dyn BusReader>>>,
}

impl LogGateway {
    pub fn new(bus: Arc<dyn MessageBus>, topic_name: impl Into<String>, operation_timeout: Duration) -> Self {
        Self {
            bus,
            topic_name: topic_name.into(),
            operation_timeout,
            producers: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
        }
    }

    pub fn partition_topic(&self, partition: i32) -> String {
        format!("{}-partition-{}", self.topic_name, partition)
    }

    /// Append one keyed record to the partition's log.
    pub async fn append(
        &self,
        partition: i32,
        key_bytes: Bytes,
        value: Bytes,
        event_time: i64,
    ) -> Result<MessageId, BusError> {
        let producer = self.producer(partition).await?;
        self.timed(producer.send(Some(key_bytes), value, event_time))
            .await
    }

    /// Append the keyless empty-value record whose id marks the upper bound
    /// of a subsequent drain.
    pub async fn append_placeholder(&self, partition: i32, event_time: i64) -> Result<MessageId, BusError> {
        let producer = self.producer(partition).await?;
        self.timed(producer.send(None, Bytes::new(), event_time)).await
    }

    /// Read the next message from the partition's compacted view.
    pub async fn read_next(&self, partition: i32) -> Result<BusMessage, BusError> {
        let reader = self.reader(partition).await?;
        self.timed(reader.read_next()).await
    }

    /// Drop the partition's handles and close them off the caller's path.
    /// Close failures are logged, never propagated.
    pub async fn close_partition(&self, partition: i32) {
        let producer = self.producers.lock().await.remove(&partition);
        let reader = self.readers.lock().await.remove(&partition);

        if let Some(producer) = producer {
            tokio::spawn(async move {
                if let Err(e) = producer.close().await {
                    error!(topic = producer.topic(), error = %e, "Failed to close producer while removing partition");
                }
            });
        }
        if let Some(reader) = reader {
            tokio::spawn(async move {
                if let Err(e) = reader.close().await {
                    error!(topic = reader.topic(), error = %e, "Failed to close reader while removing partition");
                }
            });
        }
    }

    async fn producer(&self, partition: i32) -> Result<Arc<dyn BusProducer>, BusError> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(&partition) {
            return Ok(producer.clone());
        }
        let topic = self.partition_topic(partition);
        debug!(topic = %topic, "Creating metadata log producer");
        let producer = self.bus.new_producer(&topic).await?;
        producers.insert(partition, producer.clone());
        Ok(producer)
    }

    async fn reader(&self, partition: i32) -> Result<Arc<dyn BusReader>, BusError> {
        let mut readers = self.readers.lock().await;
        if let Some(reader) = readers.get(&partition) {
            return Ok(reader.clone());
        }
        let topic = self.partition_topic(partition);
        debug!(topic = %topic, "Creating metadata log reader");
        let reader = self
            .bus
            .new_reader(&topic, StartPosition::Earliest, true)
            .await?;
        readers.insert(partition, reader.clone());
        Ok(reader)
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BusError>>,
    ) -> Result<T, BusError> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BusError::OperationTimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn topic_naming_follows_partition_suffix() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = LogGateway::new(bus, "__consumer_offsets", Duration::from_secs(5));
        assert_eq!(gateway.partition_topic(7), "__consumer_offsets-partition-7");
    }

    #[tokio::test]
    async fn handles_are_created_once_per_partition() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = LogGateway::new(bus.clone(), "meta", Duration::from_secs(5));

        gateway
            .append(3, Bytes::from_static(b"k"), Bytes::from_static(b"v"), 1)
            .await
            .unwrap();
        gateway
            .append(3, Bytes::from_static(b"k2"), Bytes::from_static(b"v2"), 2)
            .await
            .unwrap();

        assert_eq!(bus.producer_count("meta-partition-3"), 1);
    }

    #[tokio::test]
    async fn placeholder_is_keyless_and_empty() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = LogGateway::new(bus.clone(), "meta", Duration::from_secs(5));

        let id = gateway.append_placeholder(0, 42).await.unwrap();
        let msg = gateway.read_next(0).await.unwrap();
        assert_eq!(msg.id, id);
        assert!(!msg.has_key());
        assert!(msg.value.is_empty());
    }

    #[tokio::test]
    async fn append_ordering_is_preserved_per_partition() {
        let bus = Arc::new(MemoryBus::new());
        let gateway = LogGateway::new(bus, "meta", Duration::from_secs(5));

        let first = gateway
            .append(0, Bytes::from_static(b"a"), Bytes::from_static(b"1"), 1)
            .await
            .unwrap();
        let second = gateway
            .append(0, Bytes::from_static(b"b"), Bytes::from_static(b"2"), 2)
            .await
            .unwrap();
        assert!(first < second);
    }
}
