//! State Management Module
//!
//! Handles the per-shard participant registry, its SQLite persistence and
//! the interface to the external configuration store.

mod registry;
mod target;
mod tracker;

pub use registry::{
    Participant, ParticipantRegistry, ParticipantStatus, Role, ShardView, TargetPlan,
};
pub use target::{ConfigurationStore, FollowerRecord, MemoryConfigStore, ShardSnapshot, ShardTarget};
pub use tracker::StateTracker;
