//! Digest comparison sessions
//!
//! A comparison session pins a shard snapshot on the serving side under a
//! batch id. Batches expire after a TTL unless kept alive, so an abandoned
//! resync cannot hold a snapshot forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::Seq;

/// Batch handed to the comparing side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: String,
    pub shard: String,
    pub tag: Seq,
    pub ttl_secs: u64,
}

#[derive(Debug)]
struct Batch {
    shard: String,
    tag: Seq,
    expires: Instant,
}

/// Open comparison batches of one node
pub struct DigestSessions {
    ttl: Duration,
    batches: RwLock<HashMap<String, Batch>>,
}

impl DigestSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Open a batch pinning `tag` of `shard`
    pub async fn create(&self, shard: &str, tag: Seq) -> BatchInfo {
        let id = uuid::Uuid::new_v4().to_string();
        let mut batches = self.batches.write().await;
        batches.insert(
            id.clone(),
            Batch {
                shard: shard.to_string(),
                tag,
                expires: Instant::now() + self.ttl,
            },
        );
        tracing::debug!("Opened digest batch {} for shard {} at tag {}", id, shard, tag);

        BatchInfo {
            id,
            shard: shard.to_string(),
            tag,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Extend the lifetime of a live batch
    pub async fn keepalive(&self, id: &str) -> Result<()> {
        let mut batches = self.batches.write().await;
        let now = Instant::now();
        match batches.get_mut(id) {
            Some(batch) if batch.expires > now => {
                batch.expires = now + self.ttl;
                Ok(())
            }
            Some(_) => {
                batches.remove(id);
                Err(Error::BatchNotFound(id.to_string()))
            }
            None => Err(Error::BatchNotFound(id.to_string())),
        }
    }

    /// Shard and pinned tag of a live batch
    pub async fn get(&self, id: &str) -> Result<(String, Seq)> {
        let batches = self.batches.read().await;
        batches
            .get(id)
            .filter(|b| b.expires > Instant::now())
            .map(|b| (b.shard.clone(), b.tag))
            .ok_or_else(|| Error::BatchNotFound(id.to_string()))
    }

    /// Oldest tag pinned by a live batch of `shard`
    pub async fn oldest_tag(&self, shard: &str) -> Option<Seq> {
        let now = Instant::now();
        self.batches
            .read()
            .await
            .values()
            .filter(|b| b.shard == shard && b.expires > now)
            .map(|b| b.tag)
            .min()
    }

    /// Close a batch; returns whether it existed
    pub async fn delete(&self, id: &str) -> bool {
        self.batches.write().await.remove(id).is_some()
    }

    /// Drop all expired batches
    pub async fn sweep(&self) -> usize {
        let mut batches = self.batches.write().await;
        let now = Instant::now();
        let before = batches.len();
        batches.retain(|_, b| b.expires > now);
        let removed = before - batches.len();
        if removed > 0 {
            tracing::debug!("Expired {} digest batches", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.batches.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let sessions = DigestSessions::new(Duration::from_secs(60));
        let batch = sessions.create("s1", 42).await;
        assert_eq!(sessions.get(&batch.id).await.unwrap(), ("s1".to_string(), 42));
        sessions.keepalive(&batch.id).await.unwrap();
        assert!(sessions.delete(&batch.id).await);
        assert!(matches!(
            sessions.get(&batch.id).await,
            Err(Error::BatchNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_oldest_tag_is_per_shard() {
        let sessions = DigestSessions::new(Duration::from_secs(60));
        assert_eq!(sessions.oldest_tag("s1").await, None);
        let newer = sessions.create("s1", 9).await;
        sessions.create("s1", 4).await;
        sessions.create("s2", 1).await;
        assert_eq!(sessions.oldest_tag("s1").await, Some(4));
        sessions.delete(&newer.id).await;
        assert_eq!(sessions.oldest_tag("s1").await, Some(4));
    }

    #[tokio::test]
    async fn test_expired_batches_are_rejected_and_swept() {
        let sessions = DigestSessions::new(Duration::from_millis(10));
        let batch = sessions.create("s1", 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(sessions.get(&batch.id).await.is_err());
        assert_eq!(sessions.sweep().await, 1);
        assert!(sessions.keepalive(&batch.id).await.is_err());
        assert_eq!(sessions.len().await, 0);
    }
}
