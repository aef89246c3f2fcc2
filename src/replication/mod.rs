//! Replication Module
//!
//! Synchronous leader/follower replication of sequenced shard operations,
//! plus the follower-side services used by resynchronization.

mod follower;
mod leader;
mod local;
pub mod protocol;
mod rounds;

pub use follower::FollowerNode;
pub use leader::{LeaderReplicator, ReplicationOutcome};
pub use local::LocalTransport;
pub use protocol::{ApplyResponse, FrameHeader, Message, Readmission, Rejection, RepairBatch};
pub use rounds::{ShardLog, ShardRounds, SnapshotPin};

use async_trait::async_trait;

use crate::digest::{BatchInfo, BucketDigest, KeyRange};
use crate::error::Result;
use crate::store::{DigestEntry, OpEntry, Seq};

/// How a leader reaches its followers
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Deliver one sequenced operation
    async fn apply(&self, follower: &str, entry: &OpEntry) -> Result<ApplyResponse>;

    /// Stop the follower from applying replicated operations of a shard
    async fn fence(&self, follower: &str, shard: &str, generation: u64) -> Result<()>;

    /// Let the follower rejoin the replication set
    async fn readmit(&self, follower: &str, readmission: Readmission) -> Result<()>;

    /// Pin a snapshot of the follower's copy of a shard
    async fn open_batch(&self, follower: &str, shard: &str) -> Result<BatchInfo>;

    async fn keepalive_batch(&self, follower: &str, batch_id: &str) -> Result<()>;

    async fn close_batch(&self, follower: &str, batch_id: &str) -> Result<()>;

    /// Digest a key range of a pinned snapshot
    async fn digest_range(
        &self,
        follower: &str,
        batch_id: &str,
        range: KeyRange,
        parts: usize,
    ) -> Result<Vec<BucketDigest>>;

    /// (key, revision) pairs of a key range of a pinned snapshot
    async fn scan_range(&self, follower: &str, batch_id: &str, range: KeyRange) -> Result<Vec<DigestEntry>>;

    /// Overwrite follower documents; returns the follower's tag afterwards
    async fn repair(&self, follower: &str, batch: RepairBatch) -> Result<Seq>;

    /// Remove every document of a shard on the follower
    async fn truncate(&self, follower: &str, shard: &str, tag: Seq) -> Result<u64>;
}
