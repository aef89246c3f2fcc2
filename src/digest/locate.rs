//! Divergence location
//!
//! Narrows divergent bucket ranges down to leaf ranges small enough to be
//! compared document by document. Drill-down runs over an explicit work
//! queue; every range is subdivided into `fanout` sub-ranges which are
//! digested on both sides, and only those that still disagree are queued.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use super::tree::{compare_buckets, digest_range, BucketDigest, KeyRange};
use crate::error::Result;
use crate::store::{DocumentStore, Seq};

/// Something that can digest a key range at a fixed snapshot
#[async_trait]
pub trait DigestSource: Send + Sync {
    /// Digest `range` split into `parts` buckets
    async fn digest(&self, range: KeyRange, parts: usize) -> Result<Vec<BucketDigest>>;
}

/// Digest source reading a local store at a pinned tag
pub struct StoreDigestSource {
    store: Arc<dyn DocumentStore>,
    tag: Seq,
}

impl StoreDigestSource {
    pub fn new(store: Arc<dyn DocumentStore>, tag: Seq) -> Self {
        Self { store, tag }
    }
}

#[async_trait]
impl DigestSource for StoreDigestSource {
    async fn digest(&self, range: KeyRange, parts: usize) -> Result<Vec<BucketDigest>> {
        let entries = self.store.scan(range, self.tag).await?;
        Ok(digest_range(range, &entries, parts))
    }
}

/// Result of a drill-down
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Located {
    /// Ranges to compare at document level
    pub leaves: Vec<KeyRange>,
    /// Ranges that were digested on both sides
    pub ranges_examined: usize,
}

/// Work-queue driven drill-down
#[derive(Debug, Clone, Copy)]
pub struct DivergenceLocator {
    fanout: usize,
    leaf_rows: u64,
}

impl DivergenceLocator {
    pub fn new(fanout: usize, leaf_rows: u64) -> Self {
        Self {
            fanout: fanout.max(2),
            leaf_rows: leaf_rows.max(1),
        }
    }

    /// Drill down from `divergent` until every remaining range is a leaf
    pub async fn locate(
        &self,
        authoritative: &dyn DigestSource,
        replica: &dyn DigestSource,
        divergent: Vec<KeyRange>,
    ) -> Result<Located> {
        let mut queue: VecDeque<KeyRange> = divergent.into_iter().collect();
        let mut located = Located::default();

        while let Some(range) = queue.pop_front() {
            located.ranges_examined += 1;
            let ours = authoritative.digest(range, self.fanout).await?;
            let theirs = replica.digest(range, self.fanout).await?;

            let rows = ours
                .iter()
                .map(|b| b.count)
                .sum::<u64>()
                .max(theirs.iter().map(|b| b.count).sum());
            if rows <= self.leaf_rows || range.width() == 1 {
                located.leaves.push(range);
                continue;
            }

            let narrowed = compare_buckets(ours, theirs);
            tracing::trace!(
                "Range {} with {} rows narrowed to {} sub-ranges",
                range,
                rows,
                narrowed.len()
            );
            queue.extend(narrowed);
        }

        located.leaves.sort();
        Ok(located)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::tree::{compare, DigestTree};
    use crate::store::{Document, MemoryStore};
    use serde_json::json;

    async fn populate(store: &MemoryStore, n: u64) {
        for i in 0..n {
            store
                .put(
                    Document {
                        key: format!("doc-{}", i),
                        revision: i + 1,
                        body: json!(i),
                    },
                    i + 1,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_locates_single_divergent_key() {
        let leader = Arc::new(MemoryStore::new());
        let follower = Arc::new(MemoryStore::new());
        populate(&leader, 2000).await;
        populate(&follower, 2000).await;
        follower
            .put(
                Document {
                    key: "doc-77".into(),
                    revision: 9999,
                    body: json!("stale"),
                },
                2001,
            )
            .await
            .unwrap();
        leader.advance_tag(2001).await.unwrap();

        let leader_entries = leader.scan(KeyRange::FULL, 2001).await.unwrap();
        let follower_entries = follower.scan(KeyRange::FULL, 2001).await.unwrap();
        let a = DigestTree::build("s1", 2001, &leader_entries, 16);
        let b = DigestTree::build("s1", 2001, &follower_entries, 16);
        let divergent = compare(&a, &b);
        assert_eq!(divergent.len(), 1);

        let locator = DivergenceLocator::new(16, 64);
        let located = locator
            .locate(
                &StoreDigestSource::new(leader.clone(), 2001),
                &StoreDigestSource::new(follower.clone(), 2001),
                divergent,
            )
            .await
            .unwrap();

        let target = crate::store::key_position("doc-77");
        assert_eq!(located.leaves.len(), 1);
        assert!(located.leaves[0].contains(target));
        assert!(located.ranges_examined >= 2);
    }

    #[tokio::test]
    async fn test_identical_ranges_produce_no_leaves() {
        let leader = Arc::new(MemoryStore::new());
        let follower = Arc::new(MemoryStore::new());
        populate(&leader, 500).await;
        populate(&follower, 500).await;

        let locator = DivergenceLocator::new(16, 8);
        let located = locator
            .locate(
                &StoreDigestSource::new(leader, 500),
                &StoreDigestSource::new(follower, 500),
                vec![KeyRange::FULL],
            )
            .await
            .unwrap();
        assert!(located.leaves.is_empty());
    }
}
