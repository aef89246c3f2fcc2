//! In-process transport
//!
//! Connects a leader to [`FollowerNode`]s living in the same process. Used by
//! the stand-alone node and by tests, with fault injection for unreachable
//! or slow followers and one-shot rejections.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::follower::FollowerNode;
use super::protocol::{ApplyResponse, Readmission, Rejection, RepairBatch};
use super::ReplicaTransport;
use crate::digest::{BatchInfo, BucketDigest, KeyRange};
use crate::error::{Error, Result};
use crate::store::{DigestEntry, OpEntry, Seq};

/// Transport to followers in this process
#[derive(Default)]
pub struct LocalTransport {
    followers: RwLock<HashMap<String, Arc<FollowerNode>>>,
    unreachable: RwLock<HashSet<String>>,
    /// Delay added to every call to a follower
    latency: RwLock<HashMap<String, Duration>>,
    keepalives: AtomicUsize,
    /// Rejections returned instead of delivering the next applies, per (follower, shard)
    injected: RwLock<HashMap<(String, String), VecDeque<Rejection>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, follower: Arc<FollowerNode>) {
        self.followers
            .write()
            .await
            .insert(follower.node_id().to_string(), follower);
    }

    /// Make a follower unreachable or reachable again
    pub async fn set_reachable(&self, follower: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write().await;
        if reachable {
            unreachable.remove(follower);
        } else {
            unreachable.insert(follower.to_string());
        }
    }

    /// Delay every call to `follower`; zero removes the delay
    pub async fn set_latency(&self, follower: &str, latency: Duration) {
        let mut delays = self.latency.write().await;
        if latency.is_zero() {
            delays.remove(follower);
        } else {
            delays.insert(follower.to_string(), latency);
        }
    }

    /// Batch keepalives sent so far
    pub fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::Relaxed)
    }

    /// Answer the next apply of `shard` to `follower` with `rejection`
    pub async fn inject_rejection(&self, follower: &str, shard: &str, rejection: Rejection) {
        self.injected
            .write()
            .await
            .entry((follower.to_string(), shard.to_string()))
            .or_default()
            .push_back(rejection);
    }

    async fn node(&self, follower: &str) -> Result<Arc<FollowerNode>> {
        let latency = self.latency.read().await.get(follower).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.read().await.contains(follower) {
            return Err(Error::ConnectionFailed {
                address: follower.to_string(),
                reason: "unreachable".into(),
            });
        }
        self.followers
            .read()
            .await
            .get(follower)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed {
                address: follower.to_string(),
                reason: "unknown follower".into(),
            })
    }
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn apply(&self, follower: &str, entry: &OpEntry) -> Result<ApplyResponse> {
        let node = self.node(follower).await?;
        let injected = {
            let mut injected = self.injected.write().await;
            injected
                .get_mut(&(follower.to_string(), entry.header.shard.clone()))
                .and_then(|queue| queue.pop_front())
        };
        if let Some(rejection) = injected {
            return Ok(ApplyResponse::Rejected(rejection));
        }
        node.apply(entry).await
    }

    async fn fence(&self, follower: &str, shard: &str, generation: u64) -> Result<()> {
        self.node(follower).await?.fence(shard, generation).await
    }

    async fn readmit(&self, follower: &str, readmission: Readmission) -> Result<()> {
        self.node(follower).await?.readmit(readmission).await
    }

    async fn open_batch(&self, follower: &str, shard: &str) -> Result<BatchInfo> {
        self.node(follower).await?.open_batch(shard).await
    }

    async fn keepalive_batch(&self, follower: &str, batch_id: &str) -> Result<()> {
        self.keepalives.fetch_add(1, Ordering::Relaxed);
        self.node(follower).await?.keepalive_batch(batch_id).await
    }

    async fn close_batch(&self, follower: &str, batch_id: &str) -> Result<()> {
        self.node(follower).await?.close_batch(batch_id).await
    }

    async fn digest_range(
        &self,
        follower: &str,
        batch_id: &str,
        range: KeyRange,
        parts: usize,
    ) -> Result<Vec<BucketDigest>> {
        self.node(follower)
            .await?
            .digest_range(batch_id, range, parts)
            .await
    }

    async fn scan_range(&self, follower: &str, batch_id: &str, range: KeyRange) -> Result<Vec<DigestEntry>> {
        self.node(follower).await?.scan_range(batch_id, range).await
    }

    async fn repair(&self, follower: &str, batch: RepairBatch) -> Result<Seq> {
        self.node(follower).await?.repair(batch).await
    }

    async fn truncate(&self, follower: &str, shard: &str, tag: Seq) -> Result<u64> {
        self.node(follower).await?.truncate(shard, tag).await
    }
}
