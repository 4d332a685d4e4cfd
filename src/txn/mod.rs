//! Transaction coordination state
//!
//! The [`TransactionStateManager`] owns the transaction metadata cache and
//! the lifecycle of the transaction log partitions this broker is coordinator
//! for.

pub mod manager;
pub mod metadata;

pub use manager::{CoordinatorEpochAndTxnMetadata, TransactionStateManager};
pub use metadata::{TransactionMetadata, TransactionResult, TxnState, TxnTransitMetadata};
