//! Configuration Store Interface
//!
//! The external configuration store holds the *target* participant set of
//! each shard and receives the *current* configuration every time the
//! registry changes it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::registry::ParticipantStatus;
use crate::config::WolfShardConfig;
use crate::error::Result;
use crate::store::Seq;

/// Desired participants of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTarget {
    pub shard: String,
    pub leader: String,
    pub followers: Vec<String>,
}

/// Published status of one follower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerRecord {
    pub id: String,
    pub status: ParticipantStatus,
    pub applied_index: Seq,
    pub last_failure: Option<String>,
}

/// Current configuration of a shard as published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shard: String,
    pub term: u64,
    pub generation: u64,
    pub leader: String,
    pub leader_seq: Seq,
    pub followers: Vec<FollowerRecord>,
    pub degraded: bool,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// External configuration store
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Target configuration of a shard, if one is defined
    async fn read_target(&self, shard: &str) -> Result<Option<ShardTarget>>;

    /// Record the current configuration of a shard
    async fn publish_current(&self, snapshot: ShardSnapshot) -> Result<()>;
}

/// In-process configuration store
#[derive(Default)]
pub struct MemoryConfigStore {
    targets: RwLock<HashMap<String, ShardTarget>>,
    published: RwLock<HashMap<String, ShardSnapshot>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed targets from the `[[shards]]` sections of a node config
    pub fn from_config(config: &WolfShardConfig) -> Self {
        let targets = config
            .shards
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    ShardTarget {
                        shard: s.id.clone(),
                        leader: s.leader.clone(),
                        followers: s.followers.clone(),
                    },
                )
            })
            .collect();

        Self {
            targets: RwLock::new(targets),
            published: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_target(&self, target: ShardTarget) {
        self.targets.write().await.insert(target.shard.clone(), target);
    }

    /// Last snapshot published for a shard
    pub async fn published(&self, shard: &str) -> Option<ShardSnapshot> {
        self.published.read().await.get(shard).cloned()
    }
}

#[async_trait]
impl ConfigurationStore for MemoryConfigStore {
    async fn read_target(&self, shard: &str) -> Result<Option<ShardTarget>> {
        Ok(self.targets.read().await.get(shard).cloned())
    }

    async fn publish_current(&self, snapshot: ShardSnapshot) -> Result<()> {
        let mut published = self.published.write().await;
        // Generations only move forward; ignore reordered publications
        if let Some(existing) = published.get(&snapshot.shard) {
            if existing.generation > snapshot.generation {
                return Ok(());
            }
        }
        published.insert(snapshot.shard.clone(), snapshot);
        Ok(())
    }
}
