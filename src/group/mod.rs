//! Consumer group coordination state
//!
//! The [`GroupMetadataManager`] owns the group metadata cache and the
//! lifecycle of the group metadata partitions this broker is coordinator for.

pub mod manager;
pub mod metadata;

pub use manager::GroupMetadataManager;
pub use metadata::{GroupMetadata, GroupState, MemberMetadata};
