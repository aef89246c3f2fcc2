//! Replication metrics
//!
//! Counters are monotonic and reset only on process start. The per-follower
//! gauge holds the last sequence number each follower acknowledged, and the
//! degraded set lists shards currently replicating leader-only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::store::Seq;

/// Metrics registry shared by every replication component
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    dropped_followers: AtomicU64,
    tree_rebuilds: AtomicU64,
    resync_attempts: AtomicU64,
    resync_successes: AtomicU64,
    tree_builds: AtomicU64,
    rebuild_storms: AtomicU64,
    resync_timeouts: AtomicU64,
    cross_shard_aborts: AtomicU64,
    intermediate_commits: AtomicU64,
    /// (shard, follower) -> last acknowledged sequence
    follower_seq: Mutex<BTreeMap<(String, String), Seq>>,
    degraded: Mutex<BTreeSet<String>>,
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub dropped_followers: u64,
    pub tree_rebuilds: u64,
    pub resync_attempts: u64,
    pub resync_successes: u64,
    pub tree_builds: u64,
    pub rebuild_storms: u64,
    pub resync_timeouts: u64,
    pub cross_shard_aborts: u64,
    pub intermediate_commits: u64,
    pub follower_committed_seq: Vec<FollowerSeqGauge>,
    pub degraded_shards: Vec<String>,
}

/// Gauge sample for one (shard, follower) pair
#[derive(Debug, Clone, Serialize)]
pub struct FollowerSeqGauge {
    pub shard: String,
    pub follower: String,
    pub seq: Seq,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_dropped_followers(&self) {
        self.dropped_followers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tree_rebuilds(&self) {
        self.tree_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_resync_attempts(&self) {
        self.resync_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_resync_successes(&self) {
        self.resync_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tree_builds(&self) {
        self.tree_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rebuild_storms(&self) {
        self.rebuild_storms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_resync_timeouts(&self) {
        self.resync_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cross_shard_aborts(&self) {
        self.cross_shard_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_intermediate_commits(&self) {
        self.intermediate_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_followers(&self) -> u64 {
        self.dropped_followers.load(Ordering::Relaxed)
    }

    pub fn tree_rebuilds(&self) -> u64 {
        self.tree_rebuilds.load(Ordering::Relaxed)
    }

    pub fn resync_attempts(&self) -> u64 {
        self.resync_attempts.load(Ordering::Relaxed)
    }

    pub fn resync_successes(&self) -> u64 {
        self.resync_successes.load(Ordering::Relaxed)
    }

    pub fn resync_timeouts(&self) -> u64 {
        self.resync_timeouts.load(Ordering::Relaxed)
    }

    pub fn cross_shard_aborts(&self) -> u64 {
        self.cross_shard_aborts.load(Ordering::Relaxed)
    }

    pub fn intermediate_commits(&self) -> u64 {
        self.intermediate_commits.load(Ordering::Relaxed)
    }

    /// Record the last sequence a follower acknowledged
    pub fn set_follower_seq(&self, shard: &str, follower: &str, seq: Seq) {
        let mut gauges = self.follower_seq.lock().unwrap_or_else(|e| e.into_inner());
        let entry = gauges
            .entry((shard.to_string(), follower.to_string()))
            .or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Forget the gauge of a follower that left the shard
    pub fn clear_follower_seq(&self, shard: &str, follower: &str) {
        let mut gauges = self.follower_seq.lock().unwrap_or_else(|e| e.into_inner());
        gauges.remove(&(shard.to_string(), follower.to_string()));
    }

    pub fn follower_seq(&self, shard: &str, follower: &str) -> Option<Seq> {
        let gauges = self.follower_seq.lock().unwrap_or_else(|e| e.into_inner());
        gauges.get(&(shard.to_string(), follower.to_string())).copied()
    }

    /// Mark or clear the degraded replication flag of a shard
    pub fn set_degraded(&self, shard: &str, degraded: bool) {
        let mut set = self.degraded.lock().unwrap_or_else(|e| e.into_inner());
        if degraded {
            if set.insert(shard.to_string()) {
                tracing::warn!("Shard {} degraded to leader-only replication", shard);
            }
        } else if set.remove(shard) {
            tracing::info!("Shard {} replicating to followers again", shard);
        }
    }

    pub fn is_degraded(&self, shard: &str) -> bool {
        let set = self.degraded.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(shard)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let follower_committed_seq = self
            .follower_seq
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|((shard, follower), seq)| FollowerSeqGauge {
                shard: shard.clone(),
                follower: follower.clone(),
                seq: *seq,
            })
            .collect();
        let degraded_shards = self
            .degraded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();

        MetricsSnapshot {
            dropped_followers: self.dropped_followers.load(Ordering::Relaxed),
            tree_rebuilds: self.tree_rebuilds.load(Ordering::Relaxed),
            resync_attempts: self.resync_attempts.load(Ordering::Relaxed),
            resync_successes: self.resync_successes.load(Ordering::Relaxed),
            tree_builds: self.tree_builds.load(Ordering::Relaxed),
            rebuild_storms: self.rebuild_storms.load(Ordering::Relaxed),
            resync_timeouts: self.resync_timeouts.load(Ordering::Relaxed),
            cross_shard_aborts: self.cross_shard_aborts.load(Ordering::Relaxed),
            intermediate_commits: self.intermediate_commits.load(Ordering::Relaxed),
            follower_committed_seq,
            degraded_shards,
        }
    }
}
