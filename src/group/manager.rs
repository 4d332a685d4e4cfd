//! Group metadata manager
//!
//! Maintains the in-memory cache of consumer group metadata and committed
//! offsets for the group metadata partitions this broker owns. The cache is
//! authoritative only while the partition is owned; ownership is gained by
//! draining the compacted partition up to a placeholder marker and lost by
//! dropping the partition's slice of the cache.
//!
//! Lock order: the partition lock is always taken before any group entry
//! lock, and never held across bus I/O.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bus::{LogGateway, MessageBus};
use crate::config::OffsetConfig;
use crate::error::{CoordinatorError, ErrorCode, Result};
use crate::group::metadata::{GroupMetadata, GroupState};
use crate::lifecycle::{LoadNotifier, PartitionStates};
use crate::records::{self, BaseKey, CURRENT_GROUP_VALUE_SCHEMA_VERSION};
use crate::router;
use crate::types::{GroupTopicPartition, OffsetAndMetadata, TopicPartition, NO_PRODUCER_ID};

/// State staged by a partition drain before it is committed to the cache.
#[derive(Default)]
struct DrainedGroups {
    loaded_groups: HashMap<String, GroupMetadata>,
    removed_groups: HashSet<String>,
    loaded_offsets: HashMap<GroupTopicPartition, OffsetAndMetadata>,
    removed_offsets: HashSet<GroupTopicPartition>,
}

/// Manager for consumer group coordination metadata.
pub struct GroupMetadataManager {
    config: OffsetConfig,
    cache: DashMap<String, Arc<GroupMetadata>>,
    /// Lifecycle table for the group metadata partitions. Taken before any
    /// group lock.
    partition_states: Mutex<PartitionStates>,
    load_notifier: LoadNotifier,
    /// Groups with open transactional offset commits per producer, used to
    /// find the groups a commit/abort marker applies to.
    open_groups_for_producer: Mutex<HashMap<i64, HashSet<String>>>,
    gateway: LogGateway,
}

impl GroupMetadataManager {
    pub fn new(config: OffsetConfig, bus: Arc<dyn MessageBus>) -> Self {
        let gateway = LogGateway::new(
            bus,
            config.offsets_topic_name.clone(),
            config.operation_timeout,
        );
        Self {
            config,
            cache: DashMap::new(),
            partition_states: Mutex::new(PartitionStates::new()),
            load_notifier: LoadNotifier::new(),
            open_groups_for_producer: Mutex::new(HashMap::new()),
            gateway,
        }
    }

    // -----------------------------------------------------------------------
    // probes and reads
    // -----------------------------------------------------------------------

    pub fn current_groups(&self) -> Vec<Arc<GroupMetadata>> {
        self.cache.iter().map(|e| e.value().clone()).collect()
    }

    /// Owned group entries routed to `partition`.
    pub fn groups_for(&self, partition: i32) -> Vec<Arc<GroupMetadata>> {
        self.cache
            .iter()
            .filter(|e| self.partition_for(e.key()) == partition)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn is_partition_owned(&self, partition: i32) -> bool {
        self.partition_states.lock().is_owned(partition)
    }

    pub fn is_partition_loading(&self, partition: i32) -> bool {
        self.partition_states.lock().is_loading(partition)
    }

    pub fn partition_for(&self, group_id: &str) -> i32 {
        router::partition_for_group(group_id, self.config.offsets_topic_num_partitions)
    }

    pub fn is_group_local(&self, group_id: &str) -> bool {
        self.is_partition_owned(self.partition_for(group_id))
    }

    pub fn is_group_loading(&self, group_id: &str) -> bool {
        self.is_partition_loading(self.partition_for(group_id))
    }

    pub fn is_loading(&self) -> bool {
        self.partition_states.lock().any_loading()
    }

    /// True iff the group's partition is owned here and the group either has
    /// no cache entry or is dead.
    pub fn group_not_exists(&self, group_id: &str) -> bool {
        let states = self.partition_states.lock();
        states.is_owned(self.partition_for(group_id))
            && self
                .get_group(group_id)
                .map(|group| group.is(GroupState::Dead))
                .unwrap_or(true)
    }

    pub fn is_group_open_for_producer(&self, producer_id: i64, group_id: &str) -> bool {
        self.open_groups_for_producer
            .lock()
            .get(&producer_id)
            .map(|groups| groups.contains(group_id))
            .unwrap_or(false)
    }

    pub fn get_group(&self, group_id: &str) -> Option<Arc<GroupMetadata>> {
        self.cache.get(group_id).map(|e| e.value().clone())
    }

    /// Insert `group` if no entry exists for its id; returns the entry that
    /// is in the cache afterwards.
    pub fn add_group(&self, group: Arc<GroupMetadata>) -> Arc<GroupMetadata> {
        self.cache
            .entry(group.group_id().to_string())
            .or_insert(group)
            .value()
            .clone()
    }

    /// Committed offsets for a group, optionally restricted to `partitions`.
    pub fn get_offsets(
        &self,
        group_id: &str,
        partitions: Option<&[TopicPartition]>,
    ) -> HashMap<TopicPartition, OffsetAndMetadata> {
        let Some(group) = self.get_group(group_id) else {
            return HashMap::new();
        };
        let all = group.all_offsets();
        match partitions {
            None => all,
            Some(wanted) => wanted
                .iter()
                .filter_map(|tp| all.get(tp).map(|o| (tp.clone(), o.clone())))
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // writes
    // -----------------------------------------------------------------------

    /// Durably store a group snapshot with the given member assignments.
    /// The record is appended to the log before any caller-visible effect;
    /// transport failures surface as `CoordinatorNotAvailable`.
    pub async fn store_group(
        &self,
        group: &Arc<GroupMetadata>,
        assignments: &HashMap<String, Bytes>,
    ) -> Result<()> {
        if self.is_group_loading(group.group_id()) {
            return Err(CoordinatorError::CoordinatorLoadInProgress);
        }
        let timestamp = now_millis();
        let key = records::group_metadata_key(group.group_id());
        let value = records::group_metadata_value(group, assignments, CURRENT_GROUP_VALUE_SCHEMA_VERSION);
        let partition = self.partition_for(group.group_id());

        match self.gateway.append(partition, key, value, timestamp).await {
            Ok(_) => Ok(()),
            Err(error) => {
                debug!(group = group.group_id(), error = %error, "Failed to append group metadata");
                Err(CoordinatorError::CoordinatorNotAvailable)
            }
        }
    }

    /// Durably store offset commits for a group, one record per partition.
    ///
    /// Entries whose metadata exceeds the configured maximum are rejected
    /// with `OffsetMetadataTooLarge` without touching the log. Each accepted
    /// offset is applied to the group entry only after its append is
    /// acknowledged.
    pub async fn store_offsets(
        &self,
        group: &Arc<GroupMetadata>,
        consumer_id: &str,
        offsets: HashMap<TopicPartition, OffsetAndMetadata>,
        producer_id: i64,
        _producer_epoch: i16,
    ) -> HashMap<TopicPartition, ErrorCode> {
        let mut responses = HashMap::new();
        let mut filtered = Vec::new();
        for (tp, offset) in offsets {
            if self.validate_offset_metadata_length(&offset.metadata) {
                filtered.push((tp, offset));
            } else {
                responses.insert(tp, ErrorCode::OffsetMetadataTooLarge);
            }
        }

        if filtered.is_empty() {
            debug!(
                group = group.group_id(),
                consumer_id, "No offset metadata within size limit to store"
            );
            return responses;
        }

        if self.is_group_loading(group.group_id()) {
            for (tp, _) in filtered {
                responses.insert(tp, ErrorCode::CoordinatorLoadInProgress);
            }
            return responses;
        }
        if !self.is_group_local(group.group_id()) {
            for (tp, _) in filtered {
                responses.insert(tp, ErrorCode::NotCoordinator);
            }
            return responses;
        }

        let partition = self.partition_for(group.group_id());
        let timestamp = now_millis();
        for (tp, offset) in filtered {
            let key = records::offset_commit_key(group.group_id(), &tp);
            let value = records::offset_commit_value(&offset);
            match self.gateway.append(partition, key, value, timestamp).await {
                Ok(_) => {
                    group.on_offset_commit(tp.clone(), offset);
                    responses.insert(tp, ErrorCode::None);
                }
                Err(error) => {
                    warn!(
                        group = group.group_id(),
                        topic_partition = %tp,
                        error = %error,
                        "Failed to append offset commit record"
                    );
                    responses.insert(tp, CoordinatorError::from_append_error(&error).error_code());
                }
            }
        }

        if producer_id != NO_PRODUCER_ID {
            self.open_groups_for_producer
                .lock()
                .entry(producer_id)
                .or_default()
                .insert(group.group_id().to_string());
        }

        responses
    }

    fn validate_offset_metadata_length(&self, metadata: &str) -> bool {
        metadata.len() <= self.config.max_metadata_size
    }

    // -----------------------------------------------------------------------
    // partition lifecycle
    // -----------------------------------------------------------------------

    /// Become coordinator for `partition`: drain the compacted log into the
    /// cache and promote the partition to owned. A concurrent call for the
    /// same partition performs no second drain and resolves when the first
    /// load settles. On any read or decode failure the partition returns to
    /// absent.
    pub async fn schedule_load_group_and_offsets<F>(
        &self,
        partition: i32,
        on_group_loaded: F,
    ) -> Result<()>
    where
        F: Fn(&Arc<GroupMetadata>),
    {
        enum Gate {
            AlreadyOwned,
            Wait(Option<tokio::sync::watch::Receiver<bool>>),
            Proceed(u64),
        }

        let topic = self.gateway.partition_topic(partition);
        let gate = {
            let mut states = self.partition_states.lock();
            if states.is_owned(partition) {
                Gate::AlreadyOwned
            } else if states.is_loading(partition) {
                info!(topic = %topic, "Already loading offsets and group metadata");
                Gate::Wait(self.load_notifier.subscribe(partition))
            } else {
                states.begin_loading(partition);
                Gate::Proceed(self.load_notifier.begin(partition))
            }
        };
        let generation = match gate {
            Gate::AlreadyOwned => return Ok(()),
            Gate::Wait(subscription) => {
                if let Some(rx) = subscription {
                    LoadNotifier::wait(rx).await;
                }
                return Ok(());
            }
            Gate::Proceed(generation) => generation,
        };

        info!(topic = %topic, "Scheduling loading of offsets and group metadata");
        let start_ms = now_millis();
        let result = self.load_and_commit(partition, &on_group_loaded).await;
        match &result {
            Ok(()) => info!(
                topic = %topic,
                elapsed_ms = now_millis() - start_ms,
                "Finished loading offsets and group metadata"
            ),
            Err(error) => error!(topic = %topic, error = %error, "Error loading offsets and group metadata"),
        }
        self.load_notifier.finish(partition, generation);
        result
    }

    async fn load_and_commit<F>(&self, partition: i32, on_group_loaded: &F) -> Result<()>
    where
        F: Fn(&Arc<GroupMetadata>),
    {
        match self.drain_partition(partition).await {
            Err(error) => {
                self.partition_states.lock().clear_loading(partition);
                Err(error)
            }
            Ok(drained) => {
                let loaded = {
                    let mut states = self.partition_states.lock();
                    if !states.promote(partition) {
                        warn!(partition, "Partition was unloaded while loading, abandoning staged groups");
                        return Ok(());
                    }
                    self.commit_drained(drained)
                };
                for group in &loaded {
                    on_group_loaded(group);
                }
                Ok(())
            }
        }
    }

    /// Drain the partition's compacted view up to a fresh placeholder marker,
    /// staging groups and offsets locally.
    async fn drain_partition(&self, partition: i32) -> Result<DrainedGroups> {
        let end_id = self
            .gateway
            .append_placeholder(partition, now_millis())
            .await?;
        let mut drained = DrainedGroups::default();

        loop {
            let message = self.gateway.read_next(partition).await?;
            if message.id >= end_id {
                break;
            }
            // messages without a key are placeholders
            let Some(key_bytes) = message.key_bytes else {
                continue;
            };
            match records::read_message_key(key_bytes)? {
                BaseKey::GroupMetadata(group_id) => {
                    if message.value.is_empty() {
                        drained.loaded_groups.remove(&group_id);
                        drained.removed_groups.insert(group_id);
                    } else {
                        match records::read_group_message_value(&group_id, message.value)? {
                            Some(group) => {
                                drained.removed_groups.remove(&group_id);
                                drained.loaded_groups.insert(group_id, group);
                            }
                            None => {
                                drained.loaded_groups.remove(&group_id);
                                drained.removed_groups.insert(group_id);
                            }
                        }
                    }
                }
                BaseKey::Offset(gtp) => {
                    if message.value.is_empty() {
                        drained.loaded_offsets.remove(&gtp);
                        drained.removed_offsets.insert(gtp);
                    } else {
                        match records::read_offset_message_value(message.value)? {
                            Some(offset) => {
                                drained.removed_offsets.remove(&gtp);
                                drained.loaded_offsets.insert(gtp, offset);
                            }
                            None => {
                                drained.loaded_offsets.remove(&gtp);
                                drained.removed_offsets.insert(gtp);
                            }
                        }
                    }
                }
            }
        }

        Ok(drained)
    }

    /// Commit staged load state into the cache. Runs under the partition
    /// lock; returns the groups to hand to the load callback.
    fn commit_drained(&self, drained: DrainedGroups) -> Vec<Arc<GroupMetadata>> {
        let mut offsets_by_group: HashMap<String, Vec<(TopicPartition, OffsetAndMetadata)>> =
            HashMap::new();
        for (gtp, offset) in drained.loaded_offsets {
            offsets_by_group
                .entry(gtp.group)
                .or_default()
                .push((gtp.topic_partition, offset));
        }

        let mut loaded = Vec::new();
        for (group_id, group) in drained.loaded_groups {
            let group = Arc::new(group);
            if let Some(offsets) = offsets_by_group.remove(&group_id) {
                group.in_lock(|g| g.offsets.extend(offsets));
            }
            let current = self.add_group(group.clone());
            if !Arc::ptr_eq(&current, &group) {
                debug!(
                    group = %group_id,
                    loaded_generation = group.generation_id(),
                    cached_generation = current.generation_id(),
                    "Attempt to load group from the log failed because a cached group exists"
                );
            }
            loaded.push(group);
        }

        // offsets committed without group metadata belong to simple
        // consumers; an empty group entry carries them
        for (group_id, offsets) in offsets_by_group {
            let holder = self.add_group(Arc::new(GroupMetadata::new(group_id, GroupState::Empty)));
            holder.in_lock(|g| g.offsets.extend(offsets));
        }

        for gtp in &drained.removed_offsets {
            if let Some(group) = self.get_group(&gtp.group) {
                group.remove_offset(&gtp.topic_partition);
            }
        }

        for group_id in &drained.removed_groups {
            // TODO: cascade the tombstone into that group's offset records
            debug!(group = %group_id, "Group tombstone observed during load");
        }

        loaded
    }

    /// Lose coordinatorship for `partition`: drop its slice of the cache and
    /// close the gateway handles. A no-op for partitions not managed here;
    /// cancels any staged promotion of an in-flight load.
    pub async fn remove_groups_for_partition(&self, partition: i32) {
        let was_present = self.partition_states.lock().remove(partition);
        if !was_present {
            debug!(partition, "Ignoring unload of a partition not managed here");
            return;
        }

        info!(topic = %self.gateway.partition_topic(partition), "Unloading group metadata");
        self.cache.retain(|group_id, _| {
            if self.partition_for(group_id) == partition {
                info!(group = %group_id, partition, "Unloaded group metadata following local partition deletion");
                false
            } else {
                true
            }
        });
        self.gateway.close_partition(partition).await;
    }

    /// Add the partition to the owned list without loading. Test hook.
    #[cfg(test)]
    pub(crate) fn add_partition_ownership(&self, partition: i32) {
        let mut states = self.partition_states.lock();
        states.begin_loading(partition);
        states.promote(partition);
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn manager() -> (Arc<MemoryBus>, GroupMetadataManager) {
        let bus = Arc::new(MemoryBus::new());
        let manager = GroupMetadataManager::new(OffsetConfig::default(), bus.clone());
        (bus, manager)
    }

    #[test]
    fn add_group_is_put_if_absent() {
        let (_bus, manager) = manager();
        let first = Arc::new(GroupMetadata::new("g1", GroupState::Empty));
        let second = Arc::new(GroupMetadata::new("g1", GroupState::Stable));

        let added = manager.add_group(first.clone());
        assert!(Arc::ptr_eq(&added, &first));
        let kept = manager.add_group(second);
        assert!(Arc::ptr_eq(&kept, &first));
    }

    #[test]
    fn group_not_exists_requires_owned_partition() {
        let (_bus, manager) = manager();
        // partition not owned: the group cannot be said to not exist
        assert!(!manager.group_not_exists("g1"));

        manager.add_partition_ownership(manager.partition_for("g1"));
        assert!(manager.group_not_exists("g1"));

        manager.add_group(Arc::new(GroupMetadata::new("g1", GroupState::Stable)));
        assert!(!manager.group_not_exists("g1"));

        manager
            .get_group("g1")
            .unwrap()
            .in_lock(|g| g.state = GroupState::Dead);
        assert!(manager.group_not_exists("g1"));
    }

    #[test]
    fn open_groups_for_producer_index() {
        let (_bus, manager) = manager();
        assert!(!manager.is_group_open_for_producer(9000, "g1"));
        manager
            .open_groups_for_producer
            .lock()
            .entry(9000)
            .or_default()
            .insert("g1".to_string());
        assert!(manager.is_group_open_for_producer(9000, "g1"));
        assert!(!manager.is_group_open_for_producer(9001, "g1"));
    }

    #[tokio::test]
    async fn store_group_maps_transport_errors() {
        let (bus, manager) = manager();
        let group = Arc::new(GroupMetadata::new("g1", GroupState::Stable));

        assert!(manager.store_group(&group, &HashMap::new()).await.is_ok());

        bus.fail_appends(crate::bus::BusError::Transport("connection reset".into()));
        let err = manager
            .store_group(&group, &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::CoordinatorNotAvailable);
    }

    #[tokio::test]
    async fn store_offsets_filters_oversized_metadata() {
        let (bus, manager) = manager();
        let group = Arc::new(GroupMetadata::new("g1", GroupState::Stable));
        manager.add_partition_ownership(manager.partition_for("g1"));

        let mut offsets = HashMap::new();
        offsets.insert(
            TopicPartition::new("orders", 0),
            OffsetAndMetadata::new(10, "ok", 1),
        );
        offsets.insert(
            TopicPartition::new("orders", 1),
            OffsetAndMetadata::new(11, "x".repeat(5000), 1),
        );

        let responses = manager
            .store_offsets(&group, "consumer-1", offsets, NO_PRODUCER_ID, -1)
            .await;
        assert_eq!(
            responses[&TopicPartition::new("orders", 0)],
            ErrorCode::None
        );
        assert_eq!(
            responses[&TopicPartition::new("orders", 1)],
            ErrorCode::OffsetMetadataTooLarge
        );

        // only the valid offset reached the log
        let topic = manager.gateway.partition_topic(manager.partition_for("g1"));
        assert_eq!(bus.message_count(&topic), 1);
        assert_eq!(
            group
                .committed_offset(&TopicPartition::new("orders", 0))
                .map(|o| o.offset),
            Some(10)
        );
        assert!(group
            .committed_offset(&TopicPartition::new("orders", 1))
            .is_none());
    }

    #[tokio::test]
    async fn store_offsets_requires_local_group() {
        let (_bus, manager) = manager();
        let group = Arc::new(GroupMetadata::new("g1", GroupState::Stable));

        let mut offsets = HashMap::new();
        offsets.insert(
            TopicPartition::new("orders", 0),
            OffsetAndMetadata::new(10, "", 1),
        );
        let responses = manager
            .store_offsets(&group, "consumer-1", offsets, NO_PRODUCER_ID, -1)
            .await;
        assert_eq!(
            responses[&TopicPartition::new("orders", 0)],
            ErrorCode::NotCoordinator
        );
    }

    #[tokio::test]
    async fn transactional_offset_commit_registers_producer() {
        let (_bus, manager) = manager();
        let group = Arc::new(GroupMetadata::new("g1", GroupState::Stable));
        manager.add_partition_ownership(manager.partition_for("g1"));

        let mut offsets = HashMap::new();
        offsets.insert(
            TopicPartition::new("orders", 0),
            OffsetAndMetadata::new(10, "", 1),
        );
        manager
            .store_offsets(&group, "consumer-1", offsets, 9000, 0)
            .await;
        assert!(manager.is_group_open_for_producer(9000, "g1"));
    }
}
