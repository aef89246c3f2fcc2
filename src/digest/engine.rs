//! Digest Tree Engine
//!
//! Builds digest trees lazily on the first comparison and caches them per
//! shard for the snapshot they were built at. Cached trees are verified
//! against the store before use; a corrupted tree is rebuilt once, and a
//! shard whose tree keeps needing rebuilds is reported instead of looping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use super::locate::{DigestSource, DivergenceLocator};
use super::tree::{bucket_count, compare_buckets, DigestTree, KeyRange};
use crate::config::DigestConfig;
use crate::error::{Error, Result};
use crate::metrics::ReplicationMetrics;
use crate::store::{DocumentStore, Seq};

/// Why a tree is rebuilt from scratch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// A follower was just admitted
    FreshAdmission,
    /// Verification of the cached tree failed
    Corruption,
    /// The store was rewritten in bulk underneath the tree
    StructuralRewrite,
}

impl std::fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebuildReason::FreshAdmission => write!(f, "fresh admission"),
            RebuildReason::Corruption => write!(f, "corruption"),
            RebuildReason::StructuralRewrite => write!(f, "structural rewrite"),
        }
    }
}

#[derive(Default)]
struct Slot {
    tree: Option<DigestTree>,
    pending: Option<RebuildReason>,
    rebuilds: VecDeque<Instant>,
}

/// Per-shard digest tree cache
pub struct DigestEngine {
    config: DigestConfig,
    metrics: Arc<ReplicationMetrics>,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl DigestEngine {
    pub fn new(config: DigestConfig, metrics: Arc<ReplicationMetrics>) -> Self {
        Self {
            config,
            metrics,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Locator configured with this engine's fanout and leaf size
    pub fn locator(&self) -> DivergenceLocator {
        DivergenceLocator::new(self.config.fanout, self.config.leaf_rows)
    }

    async fn slot(&self, shard: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        slots.entry(shard.to_string()).or_default().clone()
    }

    /// Tree of `shard` at `tag`, built on first use and cached afterwards
    pub async fn tree(&self, shard: &str, store: &dyn DocumentStore, tag: Seq) -> Result<DigestTree> {
        let slot = self.slot(shard).await;
        let mut slot = slot.lock().await;

        if let Some(reason) = slot.pending.take() {
            return self.rebuild_locked(shard, &mut slot, store, tag, reason).await;
        }

        if let Some(cached) = slot.tree.as_ref().filter(|t| t.snapshot_tag() == tag) {
            match verify(cached, store).await {
                Ok(()) => return Ok(cached.clone()),
                Err(Error::TreeCorruption { reason, .. }) => {
                    tracing::warn!("Cached digest tree of shard {} is corrupt: {}", shard, reason);
                    return self
                        .rebuild_locked(shard, &mut slot, store, tag, RebuildReason::Corruption)
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        let tree = build(shard, store, tag).await?;
        self.metrics.increment_tree_builds();
        tracing::debug!(
            "Built digest tree for shard {} at tag {} ({} rows, {} buckets)",
            shard,
            tag,
            tree.count(),
            tree.buckets().len()
        );
        slot.tree = Some(tree.clone());
        Ok(tree)
    }

    /// Force a full rebuild of the tree of `shard` at `tag`
    pub async fn rebuild(
        &self,
        shard: &str,
        store: &dyn DocumentStore,
        tag: Seq,
        reason: RebuildReason,
    ) -> Result<DigestTree> {
        let slot = self.slot(shard).await;
        let mut slot = slot.lock().await;
        slot.pending = None;
        self.rebuild_locked(shard, &mut slot, store, tag, reason).await
    }

    /// Discard the cached tree; the next comparison rebuilds it
    pub async fn invalidate(&self, shard: &str, reason: RebuildReason) {
        let slot = self.slot(shard).await;
        let mut slot = slot.lock().await;
        slot.tree = None;
        slot.pending = Some(reason);
        tracing::debug!("Digest tree of shard {} invalidated ({})", shard, reason);
    }

    /// Drop everything held for a shard; returns false if nothing was held
    pub async fn forget(&self, shard: &str) -> bool {
        self.slots.lock().await.remove(shard).is_some()
    }

    /// Cached tree of a shard, if any
    pub async fn cached(&self, shard: &str) -> Option<DigestTree> {
        let slot = self.slot(shard).await;
        let slot = slot.lock().await;
        slot.tree.clone()
    }

    /// Compare the local tree of `shard` at `tag` against a remote digest source
    pub async fn compare_remote(
        &self,
        shard: &str,
        store: &dyn DocumentStore,
        tag: Seq,
        remote: &dyn DigestSource,
    ) -> Result<Vec<KeyRange>> {
        let tree = self.tree(shard, store, tag).await?;
        let theirs = remote.digest(KeyRange::FULL, tree.buckets().len()).await?;
        Ok(compare_buckets(tree.buckets().iter().copied(), theirs))
    }

    async fn rebuild_locked(
        &self,
        shard: &str,
        slot: &mut Slot,
        store: &dyn DocumentStore,
        tag: Seq,
        reason: RebuildReason,
    ) -> Result<DigestTree> {
        let now = Instant::now();
        let window = self.config.rebuild_window();
        while slot
            .rebuilds
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            slot.rebuilds.pop_front();
        }

        slot.tree = None;
        if slot.rebuilds.len() >= self.config.rebuild_storm_threshold {
            self.metrics.increment_rebuild_storms();
            tracing::error!(
                "Digest tree of shard {} rebuilt {} times in {}s, refusing rebuild for {}",
                shard,
                slot.rebuilds.len(),
                self.config.rebuild_window_secs,
                reason
            );
            return Err(Error::RebuildStorm {
                shard: shard.to_string(),
                rebuilds: slot.rebuilds.len() + 1,
                window_secs: self.config.rebuild_window_secs,
            });
        }

        slot.rebuilds.push_back(now);
        self.metrics.increment_tree_rebuilds();
        tracing::info!("Rebuilding digest tree of shard {} at tag {} ({})", shard, tag, reason);

        let tree = build(shard, store, tag).await?;
        verify(&tree, store).await?;
        slot.tree = Some(tree.clone());
        Ok(tree)
    }
}

async fn build(shard: &str, store: &dyn DocumentStore, tag: Seq) -> Result<DigestTree> {
    let entries = store.scan(KeyRange::FULL, tag).await?;
    let buckets = bucket_count(entries.len() as u64);
    Ok(DigestTree::build(shard, tag, &entries, buckets))
}

/// Structural check plus a direct recount from the store
async fn verify(tree: &DigestTree, store: &dyn DocumentStore) -> Result<()> {
    tree.verify_structure()?;
    let recount = store.count(tree.snapshot_tag()).await?;
    if recount != tree.count() {
        return Err(Error::TreeCorruption {
            shard: tree.shard().to_string(),
            reason: format!("tree holds {} rows, store holds {}", tree.count(), recount),
        });
    }
    Ok(())
}
