//! Transaction state manager
//!
//! Maintains the in-memory transaction metadata cache for the transaction log
//! partitions this broker owns. The cache is two-level: partition index to a
//! cache slot carrying the partition's coordinator epoch, then transactional
//! id to entry. The coordinator epoch is bumped on every load, and every
//! append re-validates it after the acknowledgement so a migration during the
//! append window is detected instead of silently clobbering the new owner.
//!
//! Lock order: the state lock (read/write) is taken before any entry lock.
//! The append pipeline deliberately holds the state lock in read mode across
//! the append await; an unloader waiting in write mode therefore cannot slip
//! between the epoch check and the durable append.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::bus::{LogGateway, MessageBus};
use crate::config::TransactionConfig;
use crate::error::{CoordinatorError, Result};
use crate::lifecycle::LoadNotifier;
use crate::records;
use crate::txn::metadata::{TransactionMetadata, TransactionResult, TxnState, TxnTransitMetadata};

/// One partition's slice of the cache, tagged with the coordinator epoch
/// assigned when the partition was loaded.
struct TxnMetadataCacheEntry {
    coordinator_epoch: i32,
    metadata_per_transactional_id: DashMap<String, Arc<TransactionMetadata>>,
}

/// Coordinator epoch and entry returned by the canonical read path.
#[derive(Clone, Debug)]
pub struct CoordinatorEpochAndTxnMetadata {
    pub coordinator_epoch: i32,
    pub transaction_metadata: Arc<TransactionMetadata>,
}

/// Loading set and cache slots, guarded together by the state lock.
struct TxnCaches {
    /// Partitions with a drain in progress. Checked before every cache read.
    loading_partitions: HashSet<i32>,
    /// Cache slots indexed by transaction log partition.
    transaction_metadata_cache: HashMap<i32, TxnMetadataCacheEntry>,
}

enum LoadGate {
    AlreadyOwned,
    Wait(tokio::sync::watch::Receiver<bool>),
    Settled,
    Proceed(u64),
}

/// Manager for transaction coordination metadata.
pub struct TransactionStateManager {
    config: TransactionConfig,
    state_lock: RwLock<TxnCaches>,
    gateway: LogGateway,
    /// Source of coordinator epochs; monotonic across loads.
    epoch_counter: AtomicI32,
    load_notifier: LoadNotifier,
}

impl TransactionStateManager {
    pub fn new(config: TransactionConfig, bus: Arc<dyn MessageBus>) -> Self {
        let gateway = LogGateway::new(
            bus,
            config.transaction_metadata_topic_name.clone(),
            config.operation_timeout,
        );
        Self {
            config,
            state_lock: RwLock::new(TxnCaches {
                loading_partitions: HashSet::new(),
                transaction_metadata_cache: HashMap::new(),
            }),
            gateway,
            epoch_counter: AtomicI32::new(0),
            load_notifier: LoadNotifier::new(),
        }
    }

    // -----------------------------------------------------------------------
    // probes and reads
    // -----------------------------------------------------------------------

    pub fn partition_for(&self, transactional_id: &str) -> i32 {
        crate::router::partition_for_transaction(
            transactional_id,
            self.config.transaction_log_num_partitions,
        )
    }

    /// `0 < timeout <= transaction_max_timeout_ms`
    pub fn validate_transaction_timeout_ms(&self, txn_timeout_ms: i32) -> bool {
        txn_timeout_ms > 0 && txn_timeout_ms <= self.config.transaction_max_timeout_ms
    }

    pub async fn is_partition_loading(&self, partition: i32) -> bool {
        self.state_lock
            .read()
            .await
            .loading_partitions
            .contains(&partition)
    }

    pub async fn is_partition_owned(&self, partition: i32) -> bool {
        let caches = self.state_lock.read().await;
        caches.transaction_metadata_cache.contains_key(&partition)
            && !caches.loading_partitions.contains(&partition)
    }

    /// Canonical read path: loading partition yields
    /// `ConcurrentTransactions`, an unowned partition `NotCoordinator`, and
    /// an owned partition the epoch-tagged entry or `None`.
    pub async fn get_transaction_state(
        &self,
        transactional_id: &str,
    ) -> Result<Option<CoordinatorEpochAndTxnMetadata>> {
        let caches = self.state_lock.read().await;
        Self::lookup(&caches, self.partition_for(transactional_id), transactional_id, None)
    }

    /// Seed a new entry unless one already exists; returns whichever entry is
    /// in the cache afterwards.
    pub async fn put_transaction_state_if_not_exists(
        &self,
        metadata: TransactionMetadata,
    ) -> Result<CoordinatorEpochAndTxnMetadata> {
        let metadata = Arc::new(metadata);
        let transactional_id = metadata.transactional_id().to_string();
        let caches = self.state_lock.read().await;
        Self::lookup(
            &caches,
            self.partition_for(&transactional_id),
            &transactional_id,
            Some(metadata),
        )?
        .ok_or_else(|| {
            CoordinatorError::UnknownServerError(format!(
                "unexpected empty transaction state returned while putting {transactional_id}"
            ))
        })
    }

    /// Single-pass cache lookup under an already-held state lock. Optionally
    /// inserts `created` when the id has no entry.
    fn lookup(
        caches: &TxnCaches,
        partition: i32,
        transactional_id: &str,
        created: Option<Arc<TransactionMetadata>>,
    ) -> Result<Option<CoordinatorEpochAndTxnMetadata>> {
        if caches.loading_partitions.contains(&partition) {
            return Err(CoordinatorError::ConcurrentTransactions);
        }
        let Some(entry) = caches.transaction_metadata_cache.get(&partition) else {
            return Err(CoordinatorError::NotCoordinator);
        };

        let metadata = match entry.metadata_per_transactional_id.get(transactional_id) {
            Some(existing) => Some(existing.value().clone()),
            None => created.map(|fresh| {
                entry
                    .metadata_per_transactional_id
                    .entry(transactional_id.to_string())
                    .or_insert(fresh)
                    .value()
                    .clone()
            }),
        };

        Ok(metadata.map(|transaction_metadata| CoordinatorEpochAndTxnMetadata {
            coordinator_epoch: entry.coordinator_epoch,
            transaction_metadata,
        }))
    }

    // -----------------------------------------------------------------------
    // append pipeline
    // -----------------------------------------------------------------------

    /// Append a staged transition to the transaction log and, once the append
    /// is acknowledged, complete the transition in the cache.
    ///
    /// The state read lock is held from the epoch check through the append
    /// acknowledgement, then re-acquired for the cache update; an unload that
    /// was queued during the append window is observed on re-fetch as a
    /// missing entry or a changed epoch and surfaces `NotCoordinator`.
    /// `retry_on_error` decides whether a failed append leaves the entry's
    /// pending state in place for the caller to retry.
    pub async fn append_transaction_to_log<R>(
        &self,
        transactional_id: &str,
        coordinator_epoch: i32,
        new_metadata: TxnTransitMetadata,
        retry_on_error: R,
    ) -> Result<()>
    where
        R: Fn(&CoordinatorError) -> bool,
    {
        let partition = self.partition_for(transactional_id);

        let append_result = {
            let caches = self.state_lock.read().await;
            let epoch_and_metadata =
                Self::lookup(&caches, partition, transactional_id, None)?
                    .ok_or(CoordinatorError::NotCoordinator)?;

            let epoch_matches = epoch_and_metadata
                .transaction_metadata
                .in_lock(|_| epoch_and_metadata.coordinator_epoch == coordinator_epoch);
            if !epoch_matches {
                // the coordinator epoch has changed, reply immediately
                return Err(CoordinatorError::NotCoordinator);
            }

            let key = records::transaction_log_key(transactional_id);
            let value = records::transaction_log_value(&new_metadata);
            self.gateway
                .append(partition, key, value, now_millis())
                .await
        };

        match append_result {
            Ok(message_id) => {
                info!(
                    transactional_id,
                    message_id = %message_id,
                    state = %new_metadata.txn_state,
                    "Appended new metadata for transaction id to the transaction log"
                );
                self.complete_valid_append(transactional_id, partition, coordinator_epoch, &new_metadata)
                    .await
            }
            Err(bus_error) => {
                debug!(
                    transactional_id,
                    error = %bus_error,
                    "Appending new transaction metadata failed"
                );
                let error = CoordinatorError::from_append_error(&bus_error);
                self.complete_failed_append(
                    transactional_id,
                    partition,
                    coordinator_epoch,
                    &error,
                    retry_on_error,
                )
                .await;
                Err(error)
            }
        }
    }

    /// Cache update after a successful append: re-fetch the entry and apply
    /// the transition in place, unless the partition migrated meanwhile.
    async fn complete_valid_append(
        &self,
        transactional_id: &str,
        partition: i32,
        coordinator_epoch: i32,
        new_metadata: &TxnTransitMetadata,
    ) -> Result<()> {
        let caches = self.state_lock.read().await;
        match Self::lookup(&caches, partition, transactional_id, None) {
            Err(error) => {
                info!(
                    transactional_id,
                    error = %error,
                    "Accessing the cached transaction metadata returned an error; aborting transition"
                );
                Err(error)
            }
            Ok(None) => {
                info!(
                    transactional_id,
                    partition,
                    "Transaction metadata is no longer in the cache after its append; the partition \
                     has likely emigrated, returning NotCoordinator"
                );
                Err(CoordinatorError::NotCoordinator)
            }
            Ok(Some(epoch_and_metadata)) => {
                epoch_and_metadata.transaction_metadata.in_lock(|inner| {
                    if epoch_and_metadata.coordinator_epoch != coordinator_epoch {
                        info!(
                            transactional_id,
                            expected = coordinator_epoch,
                            found = epoch_and_metadata.coordinator_epoch,
                            "Coordinator epoch changed during the append window; aborting transition"
                        );
                        Err(CoordinatorError::NotCoordinator)
                    } else {
                        inner.complete_transition_to(new_metadata).map_err(|e| {
                            error!(transactional_id, error = %e, "Failed to complete transition");
                            e
                        })
                    }
                })
            }
        }
    }

    /// Cache update after a failed append: the original append error is what
    /// the caller sees; the pending state is cleared unless the caller asked
    /// to keep it for a retry, and only while the epoch still matches.
    async fn complete_failed_append<R>(
        &self,
        transactional_id: &str,
        partition: i32,
        coordinator_epoch: i32,
        error: &CoordinatorError,
        retry_on_error: R,
    ) where
        R: Fn(&CoordinatorError) -> bool,
    {
        let caches = self.state_lock.read().await;
        match Self::lookup(&caches, partition, transactional_id, None) {
            Err(lookup_error) => {
                info!(
                    transactional_id,
                    append_error = %error,
                    lookup_error = %lookup_error,
                    "Append failed and the metadata lookup also failed; returning the append error"
                );
            }
            Ok(None) => {
                info!(
                    transactional_id,
                    append_error = %error,
                    "Append failed and the metadata is not in the cache anymore; returning the append error"
                );
            }
            Ok(Some(epoch_and_metadata)) => {
                epoch_and_metadata.transaction_metadata.in_lock(|inner| {
                    if epoch_and_metadata.coordinator_epoch == coordinator_epoch {
                        if retry_on_error(error) {
                            info!(
                                transactional_id,
                                append_error = %error,
                                pending_state = ?inner.pending_state,
                                "Append failed, keeping the pending state for the caller to retry"
                            );
                        } else {
                            info!(
                                transactional_id,
                                append_error = %error,
                                pending_state = ?inner.pending_state,
                                "Append failed, resetting the pending state"
                            );
                            inner.pending_state = None;
                        }
                    } else {
                        info!(
                            transactional_id,
                            append_error = %error,
                            "Append failed and the coordinator epoch has changed; leaving the entry as is"
                        );
                    }
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // partition lifecycle
    // -----------------------------------------------------------------------

    /// Become coordinator for `partition`: drain the compacted transaction
    /// log into the cache, resume transactions left in a preparing state, and
    /// promote the partition to owned.
    ///
    /// A concurrent call for the same partition performs no second drain and
    /// resolves when the first load settles. On any read or decode failure
    /// the partition returns to absent. `send_txn_markers` is invoked once
    /// for every loaded transaction found in `PrepareCommit` or
    /// `PrepareAbort`, with the transit staging its completion.
    pub async fn load_transactions_for_partition<F>(
        &self,
        partition: i32,
        send_txn_markers: F,
    ) -> Result<()>
    where
        F: Fn(TransactionResult, Arc<TransactionMetadata>, TxnTransitMetadata),
    {
        let topic = self.gateway.partition_topic(partition);
        let gate = {
            let mut caches = self.state_lock.write().await;
            if caches.loading_partitions.contains(&partition) {
                match self.load_notifier.subscribe(partition) {
                    Some(rx) => LoadGate::Wait(rx),
                    None => LoadGate::Settled,
                }
            } else if caches.transaction_metadata_cache.contains_key(&partition) {
                LoadGate::AlreadyOwned
            } else {
                caches.loading_partitions.insert(partition);
                let coordinator_epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
                caches.transaction_metadata_cache.insert(
                    partition,
                    TxnMetadataCacheEntry {
                        coordinator_epoch,
                        metadata_per_transactional_id: DashMap::new(),
                    },
                );
                LoadGate::Proceed(self.load_notifier.begin(partition))
            }
        };
        let generation = match gate {
            LoadGate::AlreadyOwned | LoadGate::Settled => return Ok(()),
            LoadGate::Wait(rx) => {
                info!(topic = %topic, "Already loading transaction metadata");
                LoadNotifier::wait(rx).await;
                return Ok(());
            }
            LoadGate::Proceed(generation) => generation,
        };

        info!(topic = %topic, "Start loading transaction metadata");
        let start_ms = now_millis();

        let result = match self.drain_partition(partition).await {
            Err(error) => {
                error!(topic = %topic, error = %error, "Failed to load the transaction log");
                let mut caches = self.state_lock.write().await;
                caches.loading_partitions.remove(&partition);
                caches.transaction_metadata_cache.remove(&partition);
                Err(error)
            }
            Ok(staged) => {
                let pending = {
                    let mut caches = self.state_lock.write().await;
                    self.commit_loaded_transactions(&mut caches, partition, staged)
                };
                match pending {
                    None => {
                        warn!(topic = %topic, "Partition was unloaded while loading, abandoning staged transactions");
                        Ok(())
                    }
                    Some(pending) => {
                        info!(
                            topic = %topic,
                            elapsed_ms = now_millis() - start_ms,
                            "Finished loading transaction metadata"
                        );
                        for (result, metadata, transit) in pending {
                            send_txn_markers(result, metadata, transit);
                        }
                        Ok(())
                    }
                }
            }
        };

        self.load_notifier.finish(partition, generation);
        result
    }

    /// Drain the partition's compacted view up to a fresh placeholder marker,
    /// staging entries locally.
    async fn drain_partition(&self, partition: i32) -> Result<HashMap<String, TransactionMetadata>> {
        let end_id = self
            .gateway
            .append_placeholder(partition, now_millis())
            .await?;
        debug!(
            partition,
            end = %end_id,
            "Wrote the placeholder record marking the drain upper bound"
        );

        let mut staged = HashMap::new();
        loop {
            let message = self.gateway.read_next(partition).await?;
            if message.id >= end_id {
                break;
            }
            // messages without a key are placeholders
            let Some(key_bytes) = message.key_bytes else {
                continue;
            };
            let transactional_id = records::read_transaction_log_key(key_bytes)?;
            if message.value.is_empty() {
                staged.remove(&transactional_id);
                continue;
            }
            match records::read_transaction_log_value(&transactional_id, message.value)? {
                Some(metadata) => {
                    staged.insert(transactional_id, metadata);
                }
                None => {
                    staged.remove(&transactional_id);
                }
            }
        }
        Ok(staged)
    }

    /// Commit staged entries under the state write lock and collect the
    /// transactions whose completion must resume. Returns `None` when the
    /// partition was unloaded during the drain.
    #[allow(clippy::type_complexity)]
    fn commit_loaded_transactions(
        &self,
        caches: &mut TxnCaches,
        partition: i32,
        staged: HashMap<String, TransactionMetadata>,
    ) -> Option<Vec<(TransactionResult, Arc<TransactionMetadata>, TxnTransitMetadata)>> {
        if !caches.loading_partitions.contains(&partition) {
            return None;
        }
        let entry = caches.transaction_metadata_cache.get_mut(&partition)?;

        // replace the partition's slice wholesale with the drained state
        entry.metadata_per_transactional_id.clear();
        for (transactional_id, metadata) in staged {
            entry
                .metadata_per_transactional_id
                .insert(transactional_id, Arc::new(metadata));
        }

        let now = now_millis();
        let mut pending = Vec::new();
        for item in entry.metadata_per_transactional_id.iter() {
            let metadata = item.value().clone();
            metadata.in_lock(|inner| {
                let result = match inner.state {
                    TxnState::PrepareCommit => TransactionResult::Commit,
                    TxnState::PrepareAbort => TransactionResult::Abort,
                    _ => return,
                };
                match inner.prepare_complete(now) {
                    Ok(transit) => pending.push((result, metadata.clone(), transit)),
                    Err(e) => error!(
                        transactional_id = item.key().as_str(),
                        error = %e,
                        "Failed to stage completion of a pending transaction during load"
                    ),
                }
            });
        }

        // loading is cleared before the markers go out so completing those
        // transactions is not rejected as a coordinator loading error
        caches.loading_partitions.remove(&partition);
        Some(pending)
    }

    /// Lose coordinatorship for `partition`: drop its slice of the cache and
    /// close the gateway handles. A no-op for partitions not managed here;
    /// cancels any staged promotion of an in-flight load.
    pub async fn remove_transactions_for_partition(&self, partition: i32) {
        let topic = self.gateway.partition_topic(partition);
        info!(topic = %topic, "Scheduling unloading transaction metadata");
        {
            let mut caches = self.state_lock.write().await;
            caches.loading_partitions.remove(&partition);
            if let Some(entry) = caches.transaction_metadata_cache.remove(&partition) {
                for item in entry.metadata_per_transactional_id.iter() {
                    info!(
                        transactional_id = item.key().as_str(),
                        topic = %topic,
                        "Unloaded transaction metadata following local partition deletion"
                    );
                }
            }
        }
        self.gateway.close_partition(partition).await;
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn manager() -> (Arc<MemoryBus>, TransactionStateManager) {
        let bus = Arc::new(MemoryBus::new());
        let manager = TransactionStateManager::new(TransactionConfig::default(), bus.clone());
        (bus, manager)
    }

    #[test]
    fn timeout_validation_bounds() {
        let (_bus, manager) = manager();
        assert!(manager.validate_transaction_timeout_ms(1));
        assert!(manager.validate_transaction_timeout_ms(900_000));
        assert!(!manager.validate_transaction_timeout_ms(900_001));
        assert!(!manager.validate_transaction_timeout_ms(0));
        assert!(!manager.validate_transaction_timeout_ms(-5));
    }

    #[tokio::test]
    async fn reads_on_unowned_partition_are_rejected() {
        let (_bus, manager) = manager();
        let err = manager.get_transaction_state("t1").await.unwrap_err();
        assert_eq!(err, CoordinatorError::NotCoordinator);
    }

    #[tokio::test]
    async fn put_if_not_exists_seeds_and_keeps_existing() {
        let (_bus, manager) = manager();
        manager
            .load_transactions_for_partition(manager.partition_for("t1"), |_, _, _| {})
            .await
            .unwrap();

        let seeded = manager
            .put_transaction_state_if_not_exists(TransactionMetadata::new(
                "t1",
                1000,
                0,
                60_000,
                TxnState::Empty,
                1,
            ))
            .await
            .unwrap();
        assert_eq!(seeded.transaction_metadata.producer_id(), 1000);

        // a second put for the same id keeps the first entry
        let kept = manager
            .put_transaction_state_if_not_exists(TransactionMetadata::new(
                "t1",
                2000,
                0,
                60_000,
                TxnState::Empty,
                2,
            ))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(
            &kept.transaction_metadata,
            &seeded.transaction_metadata
        ));
        assert_eq!(kept.coordinator_epoch, seeded.coordinator_epoch);
    }

    #[tokio::test]
    async fn coordinator_epoch_bumps_on_reload() {
        let (_bus, manager) = manager();
        let partition = manager.partition_for("t1");
        manager
            .load_transactions_for_partition(partition, |_, _, _| {})
            .await
            .unwrap();
        let first = manager
            .put_transaction_state_if_not_exists(TransactionMetadata::new(
                "t1",
                1000,
                0,
                60_000,
                TxnState::Empty,
                1,
            ))
            .await
            .unwrap()
            .coordinator_epoch;

        manager.remove_transactions_for_partition(partition).await;
        manager
            .load_transactions_for_partition(partition, |_, _, _| {})
            .await
            .unwrap();
        let second = manager
            .put_transaction_state_if_not_exists(TransactionMetadata::new(
                "t1",
                1000,
                0,
                60_000,
                TxnState::Empty,
                1,
            ))
            .await
            .unwrap()
            .coordinator_epoch;

        assert!(second > first);
    }
}
