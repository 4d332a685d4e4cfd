//! Partition lifecycle tracking
//!
//! Each metadata partition a manager touches is in exactly one of three
//! states: absent, loading, or owned. [`PartitionStates`] holds the two
//! non-absent sets; callers guard it with the manager's partition lock and
//! keep critical sections short. The lock is always taken before any
//! per-entry lock and never held across I/O.

use std::collections::HashMap;
use std::collections::HashSet;
use tokio::sync::watch;

/// The loading and owned partition sets of one manager.
#[derive(Debug, Default)]
pub struct PartitionStates {
    loading: HashSet<i32>,
    owned: HashSet<i32>,
}

impl PartitionStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `partition` as loading. Returns false if it is already loading
    /// or owned.
    pub fn begin_loading(&mut self, partition: i32) -> bool {
        if self.owned.contains(&partition) {
            return false;
        }
        self.loading.insert(partition)
    }

    /// Promote a loading partition to owned. Returns false if the partition
    /// is no longer loading (an unload won the race).
    pub fn promote(&mut self, partition: i32) -> bool {
        if !self.loading.remove(&partition) {
            return false;
        }
        self.owned.insert(partition);
        true
    }

    /// Abandon a failed load; the partition returns to absent.
    pub fn clear_loading(&mut self, partition: i32) {
        self.loading.remove(&partition);
    }

    /// Remove the partition from both sets. Returns true if it was present
    /// in either.
    pub fn remove(&mut self, partition: i32) -> bool {
        let was_loading = self.loading.remove(&partition);
        let was_owned = self.owned.remove(&partition);
        was_loading || was_owned
    }

    pub fn is_owned(&self, partition: i32) -> bool {
        self.owned.contains(&partition)
    }

    pub fn is_loading(&self, partition: i32) -> bool {
        self.loading.contains(&partition)
    }

    pub fn any_loading(&self) -> bool {
        !self.loading.is_empty()
    }

    pub fn owned(&self) -> impl Iterator<Item = i32> + '_ {
        self.owned.iter().copied()
    }
}

/// Completion hand-off for concurrent loads of the same partition.
///
/// The first loader registers the partition and later settles it; any
/// concurrent caller picks up a subscription and resolves when the first
/// load settles, without performing a second drain. Registrations carry a
/// generation so a loader whose registration was replaced (unload followed
/// by a fresh load) cannot settle the newer load's subscribers; its own
/// subscribers are woken when the replaced sender drops.
#[derive(Debug, Default)]
pub struct LoadNotifier {
    senders: parking_lot::Mutex<HashMap<i32, (u64, watch::Sender<bool>)>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl LoadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight load for `partition`; the returned generation
    /// must be handed back to [`finish`].
    ///
    /// [`finish`]: LoadNotifier::finish
    pub fn begin(&self, partition: i32) -> u64 {
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, _) = watch::channel(false);
        self.senders.lock().insert(partition, (generation, tx));
        generation
    }

    /// Settle the load for `partition`, waking every subscriber. A stale
    /// generation is a no-op.
    pub fn finish(&self, partition: i32, generation: u64) {
        let mut senders = self.senders.lock();
        if senders.get(&partition).map(|(g, _)| *g) == Some(generation) {
            if let Some((_, tx)) = senders.remove(&partition) {
                let _ = tx.send(true);
            }
        }
    }

    /// Subscribe to an in-flight load, if one is registered.
    pub fn subscribe(&self, partition: i32) -> Option<watch::Receiver<bool>> {
        self.senders
            .lock()
            .get(&partition)
            .map(|(_, tx)| tx.subscribe())
    }

    /// Wait until a subscription settles.
    pub async fn wait(mut rx: watch::Receiver<bool>) {
        while !*rx.borrow() {
            // a dropped sender also counts as settled
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_and_owned_stay_disjoint() {
        let mut states = PartitionStates::new();
        assert!(states.begin_loading(3));
        assert!(states.is_loading(3));
        assert!(!states.is_owned(3));

        // second load attempt is rejected while loading
        assert!(!states.begin_loading(3));

        assert!(states.promote(3));
        assert!(states.is_owned(3));
        assert!(!states.is_loading(3));

        // and rejected while owned
        assert!(!states.begin_loading(3));
    }

    #[test]
    fn promote_after_unload_is_abandoned() {
        let mut states = PartitionStates::new();
        states.begin_loading(5);
        assert!(states.remove(5));
        assert!(!states.promote(5));
        assert!(!states.is_owned(5));
    }

    #[test]
    fn failed_load_returns_to_absent() {
        let mut states = PartitionStates::new();
        states.begin_loading(2);
        states.clear_loading(2);
        assert!(!states.is_loading(2));
        assert!(!states.is_owned(2));
        assert!(!states.any_loading());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut states = PartitionStates::new();
        assert!(!states.remove(9));
        states.begin_loading(9);
        states.promote(9);
        assert!(states.remove(9));
        assert!(!states.remove(9));
    }

    #[tokio::test]
    async fn notifier_settles_subscribers() {
        let notifier = LoadNotifier::new();
        let generation = notifier.begin(1);
        let rx = notifier.subscribe(1).unwrap();

        let waiter = tokio::spawn(async move { LoadNotifier::wait(rx).await });
        tokio::task::yield_now().await;
        notifier.finish(1, generation);
        waiter.await.unwrap();

        assert!(notifier.subscribe(1).is_none());
    }

    #[tokio::test]
    async fn stale_generation_cannot_settle_a_newer_load() {
        let notifier = LoadNotifier::new();
        let first = notifier.begin(1);
        // an abandoned load is superseded by a fresh registration
        let _second = notifier.begin(1);

        notifier.finish(1, first);
        // the newer registration is still live for subscribers
        assert!(notifier.subscribe(1).is_some());
    }
}
