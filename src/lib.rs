//! WolfShard - Shard Replication Consistency Manager
//!
//! Keeps follower copies of document shards consistent with their leader.
//!
//! # Architecture
//!
//! Each shard has one leader that sequences every write and replicates it
//! synchronously to the followers in its replication set. A follower that
//! stops acknowledging is dropped from the set under a new registry
//! generation, then brought back by a background resync that compares
//! digest trees of both copies and repairs the divergent key ranges.
//!
//! # Features
//!
//! - Synchronous per-shard replication with monotonic sequence numbers
//! - Generation-guarded participant registry with SQLite persistence
//! - Range-partitioned digest trees with fast divergence location
//! - Suspicion accounting, drop and re-admission of followers
//! - Intermediate commits for long transactions
//! - HTTP API for writes, status and reconciliation control

pub mod api;
pub mod config;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod network;
pub mod node;
pub mod reconcile;
pub mod replication;
pub mod state;
pub mod store;

pub use config::WolfShardConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfShardConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::ShardNode;
    pub use crate::reconcile::{PairState, Reconciler};
    pub use crate::replication::{LeaderReplicator, ReplicaTransport, ReplicationOutcome};
    pub use crate::state::{ParticipantRegistry, ShardView, StateTracker};
    pub use crate::store::{DocumentStore, MemoryStore, Operation, Seq};
}
