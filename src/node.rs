//! Node assembly
//!
//! Wires the registry, digest engine, reconciler, leader replicator and
//! follower side of one participant together and brings the configured
//! shards up.

use std::sync::Arc;

use crate::config::WolfShardConfig;
use crate::digest::{DigestEngine, RebuildReason};
use crate::error::Result;
use crate::metrics::ReplicationMetrics;
use crate::reconcile::Reconciler;
use crate::replication::{FollowerNode, LeaderReplicator, ReplicaTransport, ShardRounds};
use crate::state::{ConfigurationStore, ParticipantRegistry, StateTracker};
use crate::store::{DocumentStore, MemoryStore};

/// Every replication component of one participant
pub struct ShardNode {
    pub config: WolfShardConfig,
    pub metrics: Arc<ReplicationMetrics>,
    pub registry: Arc<ParticipantRegistry>,
    pub rounds: Arc<ShardRounds>,
    pub engine: Arc<DigestEngine>,
    pub reconciler: Arc<Reconciler>,
    pub leader: Arc<LeaderReplicator>,
    pub follower: Arc<FollowerNode>,
}

impl ShardNode {
    /// Assemble a node; nothing is started until [`ShardNode::bootstrap`]
    pub fn new(
        config: WolfShardConfig,
        transport: Arc<dyn ReplicaTransport>,
        tracker: Option<Arc<StateTracker>>,
        config_store: Option<Arc<dyn ConfigurationStore>>,
    ) -> Self {
        let node_id = config.node.id.clone();
        let metrics = Arc::new(ReplicationMetrics::new());

        let mut registry = ParticipantRegistry::new(metrics.clone());
        if let Some(tracker) = tracker {
            registry = registry.with_tracker(tracker);
        }
        if let Some(store) = config_store {
            registry = registry.with_config_store(store);
        }
        let registry = Arc::new(registry);

        let rounds = Arc::new(ShardRounds::new());
        let engine = Arc::new(DigestEngine::new(config.digest.clone(), metrics.clone()));
        let reconciler = Arc::new(Reconciler::new(
            node_id.clone(),
            config.reconcile.clone(),
            registry.clone(),
            rounds.clone(),
            transport.clone(),
            engine.clone(),
            metrics.clone(),
        ));
        let leader = Arc::new(LeaderReplicator::new(
            node_id.clone(),
            config.replication.clone(),
            registry.clone(),
            rounds.clone(),
            transport,
            reconciler.clone(),
            metrics.clone(),
        ));
        let follower = Arc::new(FollowerNode::new(
            node_id,
            &config.replication,
            config.digest.batch_ttl(),
        ));

        Self {
            config,
            metrics,
            registry,
            rounds,
            engine,
            reconciler,
            leader,
            follower,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    /// Restore persisted state, then lead and follow the configured shards
    /// with in-memory stores
    pub async fn bootstrap(&self) -> Result<()> {
        let restored = self.registry.restore().await?;
        if restored > 0 {
            tracing::info!("Restored {} shards from state", restored);
        }

        for shard in self.config.led_shards() {
            let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
            self.lead(&shard.id, &shard.followers, store).await?;
        }

        for shard in self.config.followed_shards() {
            self.follower
                .host(&shard.id, Arc::new(MemoryStore::new()))
                .await;
        }
        Ok(())
    }

    /// Lead a shard whose local copy lives in `store`
    pub async fn lead(&self, shard: &str, followers: &[String], store: Arc<dyn DocumentStore>) -> Result<()> {
        let view = self
            .registry
            .provision(shard, self.node_id(), followers)
            .await?;

        // A restored registry may remember writes the store no longer holds;
        // keep sequences monotonic and resync every follower from scratch
        let persisted = view.leader_seq();
        if store.current_tag().await < persisted {
            tracing::warn!(
                "Local copy of shard {} is behind its last assigned seq {}, resyncing followers",
                shard,
                persisted
            );
            store.advance_tag(persisted).await?;
            self.engine
                .invalidate(shard, RebuildReason::StructuralRewrite)
                .await;
            for id in view.followers.keys() {
                self.registry.drop_follower(shard, id).await?;
            }
        }

        self.leader.lead(shard, store).await?;
        self.reconciler.on_target_change(shard).await?;
        self.reconciler.resume_excluded(shard).await?;
        Ok(())
    }

    /// Stop leading a shard and forget everything held for it
    pub async fn decommission(&self, shard: &str) -> Result<()> {
        self.registry.decommission(shard).await?;
        let cancelled = self.reconciler.forget_shard(shard).await;
        self.rounds.close(shard).await;
        self.engine.forget(shard).await;
        tracing::info!(
            "Decommissioned shard {} ({} resync tasks cancelled)",
            shard,
            cancelled
        );
        Ok(())
    }

    /// Cancel background work
    pub fn shutdown(&self) {
        self.reconciler.shutdown();
    }
}
