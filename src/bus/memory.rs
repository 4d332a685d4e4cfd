//! In-memory message bus
//!
//! A single-process bus used for embedded operation and tests. Topics are
//! plain append-only vectors; readers observe the uncompacted sequence, which
//! is a valid compacted view for load purposes since later records for a key
//! overwrite earlier staging entries during a drain.
//!
//! Test hooks: appends can be paused to keep an append pipeline in flight,
//! and subsequent appends can be failed with a chosen [`BusError`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::bus::{
    BusError, BusMessage, BusProducer, BusReader, MessageBus, MessageId, StartPosition,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    key_bytes: Option<Bytes>,
    value: Bytes,
    event_time: i64,
}

struct TopicState {
    messages: Mutex<Vec<StoredMessage>>,
    next_entry: AtomicU64,
    data_available: Notify,
}

impl TopicState {
    fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_entry: AtomicU64::new(0),
            data_available: Notify::new(),
        }
    }
}

/// Shared append hooks, visible to every producer handle.
struct Hooks {
    append_error: Mutex<Option<BusError>>,
    appends_paused: Mutex<bool>,
    append_gate: Notify,
    appends_done: AtomicUsize,
}

/// In-memory [`MessageBus`] implementation.
pub struct MemoryBus {
    topics: DashMap<String, Arc<TopicState>>,
    producers_created: DashMap<String, usize>,
    hooks: Arc<Hooks>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            producers_created: DashMap::new(),
            hooks: Arc::new(Hooks {
                append_error: Mutex::new(None),
                appends_paused: Mutex::new(false),
                append_gate: Notify::new(),
                appends_done: AtomicUsize::new(0),
            }),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicState::new()))
            .clone()
    }

    /// Number of messages currently stored for a topic.
    pub fn message_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.messages.lock().len())
            .unwrap_or(0)
    }

    /// Number of producer handles ever created for a topic.
    pub fn producer_count(&self, topic: &str) -> usize {
        self.producers_created.get(topic).map(|c| *c).unwrap_or(0)
    }

    /// Total appends acknowledged across all topics.
    pub fn appends_done(&self) -> usize {
        self.hooks.appends_done.load(Ordering::SeqCst)
    }

    /// Fail every subsequent append with `error` until cleared.
    pub fn fail_appends(&self, error: BusError) {
        *self.hooks.append_error.lock() = Some(error);
    }

    pub fn clear_append_failure(&self) {
        *self.hooks.append_error.lock() = None;
    }

    /// Hold every subsequent append in flight until [`resume_appends`] runs.
    ///
    /// [`resume_appends`]: MemoryBus::resume_appends
    pub fn pause_appends(&self) {
        *self.hooks.appends_paused.lock() = true;
    }

    pub fn resume_appends(&self) {
        *self.hooks.appends_paused.lock() = false;
        self.hooks.append_gate.notify_waiters();
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn new_producer(&self, topic: &str) -> Result<Arc<dyn BusProducer>, BusError> {
        let state = self.topic(topic);
        *self.producers_created.entry(topic.to_string()).or_insert(0) += 1;
        Ok(Arc::new(MemoryProducer {
            topic: topic.to_string(),
            state,
            hooks: self.hooks.clone(),
        }))
    }

    async fn new_reader(
        &self,
        topic: &str,
        start: StartPosition,
        _read_compacted: bool,
    ) -> Result<Arc<dyn BusReader>, BusError> {
        let state = self.topic(topic);
        let position = match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => state.messages.lock().len(),
        };
        Ok(Arc::new(MemoryReader {
            topic: topic.to_string(),
            state,
            position: AtomicUsize::new(position),
        }))
    }
}

struct MemoryProducer {
    topic: String,
    state: Arc<TopicState>,
    hooks: Arc<Hooks>,
}

impl MemoryProducer {
    async fn wait_for_gate(&self) {
        loop {
            let reopened = self.hooks.append_gate.notified();
            if !*self.hooks.appends_paused.lock() {
                return;
            }
            reopened.await;
        }
    }
}

#[async_trait]
impl BusProducer for MemoryProducer {
    async fn send(
        &self,
        key_bytes: Option<Bytes>,
        value: Bytes,
        event_time: i64,
    ) -> Result<MessageId, BusError> {
        self.wait_for_gate().await;
        if let Some(error) = self.hooks.append_error.lock().clone() {
            return Err(error);
        }
        let id = MessageId::new(0, self.state.next_entry.fetch_add(1, Ordering::SeqCst));
        self.state.messages.lock().push(StoredMessage {
            id,
            key_bytes,
            value,
            event_time,
        });
        self.hooks.appends_done.fetch_add(1, Ordering::SeqCst);
        self.state.data_available.notify_waiters();
        Ok(id)
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

struct MemoryReader {
    topic: String,
    state: Arc<TopicState>,
    position: AtomicUsize,
}

#[async_trait]
impl BusReader for MemoryReader {
    async fn read_next(&self) -> Result<BusMessage, BusError> {
        loop {
            let available = self.state.data_available.notified();
            {
                let messages = self.state.messages.lock();
                let pos = self.position.load(Ordering::SeqCst);
                if pos < messages.len() {
                    let stored = messages[pos].clone();
                    self.position.store(pos + 1, Ordering::SeqCst);
                    return Ok(BusMessage {
                        id: stored.id,
                        key_bytes: stored.key_bytes,
                        value: stored.value,
                        event_time: stored.event_time,
                    });
                }
            }
            available.await;
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn producer_and_reader_round_trip() {
        let bus = MemoryBus::new();
        let producer = bus.new_producer("t").await.unwrap();
        let reader = bus
            .new_reader("t", StartPosition::Earliest, true)
            .await
            .unwrap();

        let id = producer
            .send(Some(Bytes::from_static(b"k")), Bytes::from_static(b"v"), 7)
            .await
            .unwrap();
        let msg = reader.read_next().await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.key_bytes.as_deref(), Some(b"k".as_ref()));
        assert_eq!(&msg.value[..], b"v");
        assert_eq!(msg.event_time, 7);
    }

    #[tokio::test]
    async fn reader_waits_for_new_data() {
        let bus = Arc::new(MemoryBus::new());
        let reader = bus
            .new_reader("t", StartPosition::Earliest, true)
            .await
            .unwrap();

        let pending = tokio::spawn(async move { reader.read_next().await });
        tokio::task::yield_now().await;

        let producer = bus.new_producer("t").await.unwrap();
        producer
            .send(None, Bytes::from_static(b"late"), 1)
            .await
            .unwrap();

        let msg = pending.await.unwrap().unwrap();
        assert_eq!(&msg.value[..], b"late");
    }

    #[tokio::test]
    async fn injected_append_failure_is_returned() {
        let bus = MemoryBus::new();
        let producer = bus.new_producer("t").await.unwrap();
        bus.fail_appends(BusError::NotEnoughReplicas);
        let err = producer
            .send(None, Bytes::from_static(b"x"), 1)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::NotEnoughReplicas);

        bus.clear_append_failure();
        assert!(producer.send(None, Bytes::from_static(b"x"), 1).await.is_ok());
        assert_eq!(bus.message_count("t"), 1);
    }

    #[tokio::test]
    async fn paused_appends_block_until_resume() {
        let bus = Arc::new(MemoryBus::new());
        let producer = bus.new_producer("t").await.unwrap();
        bus.pause_appends();

        let bus2 = bus.clone();
        let inflight = tokio::spawn(async move {
            producer.send(None, Bytes::from_static(b"x"), 1).await
        });
        tokio::task::yield_now().await;
        assert_eq!(bus2.message_count("t"), 0);

        bus2.resume_appends();
        inflight.await.unwrap().unwrap();
        assert_eq!(bus2.message_count("t"), 1);
    }
}
