//! In-memory MVCC document store
//!
//! Used by the stand-alone node and by tests. Keeps the version chain of every
//! key ordered by digest position so range scans at a snapshot are cheap.
//! Versions no pinned snapshot can see are dropped by [`DocumentStore::compact`].

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{key_position, DigestEntry, Document, DocumentStore, Seq};
use crate::digest::KeyRange;
use crate::error::{Error, Result};

/// A single version of a key; `None` is a tombstone
#[derive(Debug, Clone)]
struct Version {
    tag: Seq,
    doc: Option<Document>,
}

#[derive(Default)]
struct Inner {
    chains: BTreeMap<(u64, String), Vec<Version>>,
    tag: Seq,
}

/// In-memory multi-version store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

fn visible(chain: &[Version], tag: Seq) -> Option<&Document> {
    chain
        .iter()
        .rev()
        .find(|v| v.tag <= tag)
        .and_then(|v| v.doc.as_ref())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_version(inner: &mut Inner, key: &str, doc: Option<Document>, tag: Seq) -> Result<()> {
        let chain = inner
            .chains
            .entry((key_position(key), key.to_string()))
            .or_default();

        match chain.last_mut() {
            Some(last) if last.tag > tag => {
                return Err(Error::Storage(format!(
                    "version of '{}' at tag {} precedes existing tag {}",
                    key, tag, last.tag
                )));
            }
            Some(last) if last.tag == tag => last.doc = doc,
            _ => chain.push(Version { tag, doc }),
        }

        inner.tag = inner.tag.max(tag);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn current_tag(&self) -> Seq {
        self.inner.read().await.tag
    }

    async fn advance_tag(&self, tag: Seq) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.tag = inner.tag.max(tag);
        Ok(())
    }

    async fn get(&self, key: &str, tag: Seq) -> Result<Option<Document>> {
        let inner = self.inner.read().await;
        Ok(inner
            .chains
            .get(&(key_position(key), key.to_string()))
            .and_then(|chain| visible(chain, tag))
            .cloned())
    }

    async fn put(&self, doc: Document, tag: Seq) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = doc.key.clone();
        Self::write_version(&mut inner, &key, Some(doc), tag)
    }

    async fn remove(&self, key: &str, tag: Seq) -> Result<()> {
        let mut inner = self.inner.write().await;
        let exists = inner
            .chains
            .get(&(key_position(key), key.to_string()))
            .map(|chain| visible(chain, Seq::MAX).is_some())
            .unwrap_or(false);
        if exists {
            Self::write_version(&mut inner, key, None, tag)?;
        } else {
            inner.tag = inner.tag.max(tag);
        }
        Ok(())
    }

    async fn scan(&self, range: KeyRange, tag: Seq) -> Result<Vec<DigestEntry>> {
        let inner = self.inner.read().await;
        let lower = Bound::Included((range.start, String::new()));
        let entries = inner
            .chains
            .range((lower, Bound::Unbounded))
            .take_while(|((position, _), _)| *position <= range.end)
            .filter_map(|((position, key), chain)| {
                visible(chain, tag).map(|doc| DigestEntry {
                    position: *position,
                    key: key.clone(),
                    revision: doc.revision,
                })
            })
            .collect();
        Ok(entries)
    }

    async fn count(&self, tag: Seq) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .chains
            .values()
            .filter(|chain| visible(chain, tag).is_some())
            .count() as u64)
    }

    async fn truncate(&self, tag: Seq) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let live: Vec<String> = inner
            .chains
            .iter()
            .filter(|(_, chain)| visible(chain, Seq::MAX).is_some())
            .map(|((_, key), _)| key.clone())
            .collect();
        for key in &live {
            Self::write_version(&mut inner, key, None, tag)?;
        }
        inner.tag = inner.tag.max(tag);
        Ok(live.len() as u64)
    }

    async fn compact(&self, horizon: Seq) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let horizon = horizon.min(inner.tag);
        let mut dropped = 0;
        inner.chains.retain(|_, chain| {
            // Everything before the version visible at the horizon is unreachable
            if let Some(visible_at) = chain.iter().rposition(|v| v.tag <= horizon) {
                dropped += visible_at;
                chain.drain(..visible_at);
            }
            let dead = chain.len() == 1 && chain[0].tag <= horizon && chain[0].doc.is_none();
            if dead {
                dropped += 1;
            }
            !dead
        });
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(key: &str, revision: u64) -> Document {
        Document {
            key: key.to_string(),
            revision,
            body: json!({ "v": revision }),
        }
    }

    #[tokio::test]
    async fn test_snapshot_reads() {
        let store = MemoryStore::new();
        store.put(doc("a", 1), 1).await.unwrap();
        store.put(doc("a", 2), 2).await.unwrap();
        store.remove("a", 3).await.unwrap();

        assert_eq!(store.get("a", 1).await.unwrap().unwrap().revision, 1);
        assert_eq!(store.get("a", 2).await.unwrap().unwrap().revision, 2);
        assert!(store.get("a", 3).await.unwrap().is_none());
        assert_eq!(store.current_tag().await, 3);
        assert_eq!(store.count(2).await.unwrap(), 1);
        assert_eq!(store.count(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_versions() {
        let store = MemoryStore::new();
        store.put(doc("a", 5), 5).await.unwrap();
        assert!(store.put(doc("a", 4), 4).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for i in 0..50 {
            store.put(doc(&format!("k{}", i), i + 1), i + 1).await.unwrap();
        }

        let all = store.scan(KeyRange::FULL, 50).await.unwrap();
        assert_eq!(all.len(), 50);
        assert!(all.windows(2).all(|w| w[0] <= w[1]));

        let half = KeyRange::new(0, u64::MAX / 2);
        let lower = store.scan(half, 50).await.unwrap();
        assert!(lower.iter().all(|e| e.position <= u64::MAX / 2));

        // Snapshot isolation: tag 10 sees only the first ten writes
        assert_eq!(store.scan(KeyRange::FULL, 10).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_truncate() {
        let store = MemoryStore::new();
        store.put(doc("a", 1), 1).await.unwrap();
        store.put(doc("b", 2), 2).await.unwrap();
        assert_eq!(store.truncate(3).await.unwrap(), 2);
        assert_eq!(store.count(3).await.unwrap(), 0);
        assert_eq!(store.count(2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_compaction_keeps_reads_at_or_after_horizon() {
        let store = MemoryStore::new();
        store.put(doc("a", 1), 1).await.unwrap();
        store.put(doc("a", 2), 2).await.unwrap();
        store.put(doc("a", 3), 3).await.unwrap();
        store.put(doc("b", 1), 1).await.unwrap();
        store.remove("b", 2).await.unwrap();

        // a@1 goes, b goes entirely
        assert_eq!(store.compact(2).await.unwrap(), 3);
        assert_eq!(store.get("a", 2).await.unwrap().unwrap().revision, 2);
        assert_eq!(store.get("a", 3).await.unwrap().unwrap().revision, 3);
        assert!(store.get("a", 1).await.unwrap().is_none());
        assert!(store.get("b", 2).await.unwrap().is_none());
        assert_eq!(store.count(2).await.unwrap(), 1);
        assert_eq!(store.compact(2).await.unwrap(), 0);

        // The horizon never passes the current tag
        assert_eq!(store.compact(99).await.unwrap(), 1);
        assert_eq!(store.get("a", 3).await.unwrap().unwrap().revision, 3);
        store.put(doc("a", 4), 4).await.unwrap();
        assert_eq!(store.get("a", 4).await.unwrap().unwrap().revision, 4);
    }
}
