#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Streamgate
//!
//! Streamgate is the coordinator-metadata layer of a Kafka-compatible broker
//! built on top of a log-structured message bus. It keeps the authoritative
//! state for consumer groups and exactly-once producer transactions in
//! compacted log partitions on the bus, and serves that state from in-memory
//! caches on whichever broker currently owns each partition.
//!
//! Two sibling managers share the same shape:
//!
//! - [`group::GroupMetadataManager`] — consumer-group coordination state,
//!   persisted to the `__consumer_offsets` log.
//! - [`txn::TransactionStateManager`] — transaction coordination state,
//!   persisted to the `__transaction_state` log.
//!
//! Both follow the same lifecycle for every metadata partition they own:
//!
//! ```text
//! absent ──schedule load──▶ loading ──drain complete──▶ owned ──unload──▶ absent
//! ```
//!
//! While a partition is `loading` all reads for ids routed to it fail with a
//! retriable error; once `owned`, every mutation is appended to the bus first
//! and applied to the cache only after the append is acknowledged and the
//! coordinator epoch has been re-validated.
//!
//! ## Modules
//!
//! - [`bus`]: the log-bus contract (producer/reader traits), the per-partition
//!   gateway, and an in-memory bus for embedded use and tests
//! - [`records`]: binary codec for group, offset and transaction records
//! - [`router`]: stable hash routing from id to metadata partition
//! - [`group`]: the group metadata manager and its cache entries
//! - [`txn`]: the transaction state manager and its cache entries
//! - [`config`]: injected configuration for both managers
//! - [`error`]: error types, wire error codes and the `Result` alias

pub mod bus;
pub mod config;
pub mod error;
pub mod group;
pub mod lifecycle;
pub mod records;
pub mod router;
pub mod txn;
pub mod types;

pub use config::{OffsetConfig, TransactionConfig};
pub use error::{CoordinatorError, ErrorCode, Result};
pub use types::{GroupTopicPartition, OffsetAndMetadata, TopicPartition};
