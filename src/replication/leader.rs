//! Leader Replicator
//!
//! Sequences each write of a led shard, applies it locally and fans it out
//! to the active followers, one round at a time per shard.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use super::protocol::{ApplyResponse, Rejection};
use super::rounds::{ShardLog, ShardRounds};
use super::ReplicaTransport;
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::metrics::ReplicationMetrics;
use crate::reconcile::{Reconciler, Signal, Verdict};
use crate::state::ParticipantRegistry;
use crate::store::{DocumentStore, OpEntry, Operation, Seq, TxnId};

/// Result of replicating one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplicationOutcome {
    /// Durable on the leader and every follower of the round
    Committed { seq: Seq },
    /// Durable on the leader and the remaining followers; `dropped` left the set
    PartiallyCommitted { seq: Seq, dropped: Vec<String> },
    /// The leader could not accept the operation
    Failed { reason: String },
}

impl ReplicationOutcome {
    pub fn seq(&self) -> Option<Seq> {
        match self {
            ReplicationOutcome::Committed { seq } | ReplicationOutcome::PartiallyCommitted { seq, .. } => {
                Some(*seq)
            }
            ReplicationOutcome::Failed { .. } => None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.seq().is_some()
    }
}

/// Error a follower's rejection of an entry of `shard` carrying `txn` stands for
fn rejection_error(shard: &str, follower: &str, txn: Option<TxnId>, rejection: Rejection) -> Error {
    let shard = shard.to_string();
    let follower = follower.to_string();
    match rejection {
        Rejection::Gap { expected } | Rejection::Lagging { expected } => Error::Lagging {
            shard,
            follower,
            expected,
        },
        Rejection::Hard { reason } => Error::HardRejection {
            shard,
            follower,
            reason,
        },
        Rejection::StaleTerm { term } => Error::HardRejection {
            shard,
            follower,
            reason: format!("follower is at term {}", term),
        },
        Rejection::Fenced { generation } => Error::Fenced { shard, generation },
        // An abort unwinding elsewhere, or of a transaction the entry does not carry
        Rejection::TransactionAborted { shard: other, txn: aborted }
            if other != shard || Some(aborted) != txn =>
        {
            Error::CrossShardAbortRace {
                shard: other,
                txn: aborted,
            }
        }
        other => Error::Rejected {
            shard,
            follower,
            reason: other.to_string(),
        },
    }
}

/// Leader side of every shard this node leads
pub struct LeaderReplicator {
    /// Node ID
    node_id: String,
    config: ReplicationConfig,
    registry: Arc<ParticipantRegistry>,
    rounds: Arc<ShardRounds>,
    transport: Arc<dyn ReplicaTransport>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<ReplicationMetrics>,
}

impl LeaderReplicator {
    /// Create a new leader replicator
    pub fn new(
        node_id: String,
        config: ReplicationConfig,
        registry: Arc<ParticipantRegistry>,
        rounds: Arc<ShardRounds>,
        transport: Arc<dyn ReplicaTransport>,
        reconciler: Arc<Reconciler>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        Self {
            node_id,
            config,
            registry,
            rounds,
            transport,
            reconciler,
            metrics,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start replicating a shard whose local copy lives in `store`
    pub async fn lead(&self, shard: &str, store: Arc<dyn DocumentStore>) -> Result<()> {
        self.ensure_leader(shard).await?;
        self.rounds
            .open(shard, store, self.config.max_sequence_gap as usize)
            .await;
        let last_seq = self.rounds.lock(shard).await?.last_seq();
        self.registry.record_leader_seq(shard, last_seq).await
    }

    /// Last sequence number assigned for a shard
    pub async fn last_seq(&self, shard: &str) -> Result<Seq> {
        Ok(self.rounds.lock(shard).await?.last_seq())
    }

    /// Replicate one operation to the shard's follower set
    pub async fn replicate(&self, shard: &str, op: Operation) -> ReplicationOutcome {
        match self.try_replicate(shard, op).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Replication on shard {} failed: {}", shard, e);
                ReplicationOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Replicate the commit marker of a transaction
    pub async fn commit_transaction(&self, shard: &str, txn: TxnId) -> ReplicationOutcome {
        self.replicate(shard, Operation::commit(txn)).await
    }

    /// Replicate the abort marker of a transaction, unwinding it everywhere
    pub async fn abort_transaction(&self, shard: &str, txn: TxnId) -> ReplicationOutcome {
        self.replicate(shard, Operation::abort(txn)).await
    }

    async fn ensure_leader(&self, shard: &str) -> Result<()> {
        let view = self.registry.view(shard).await?;
        if !view.role_of(&self.node_id).is_some_and(|r| r.originates_writes()) {
            return Err(Error::NotLeader {
                shard: shard.to_string(),
                leader: view.leader.id.clone(),
            });
        }
        Ok(())
    }

    async fn try_replicate(&self, shard: &str, op: Operation) -> Result<ReplicationOutcome> {
        self.ensure_leader(shard).await?;
        let mut log = self.rounds.lock(shard).await?;

        let flush_after = match op.txn {
            Some(txn) if !op.is_marker() => {
                log.applier().buffered_len(txn) + 1 >= self.config.intermediate_commit_threshold.max(1)
            }
            _ => false,
        };
        let txn = op.txn;

        let (seq, mut dropped) = self.round(&mut log, op).await?;

        if let (true, Some(txn)) = (flush_after, txn) {
            self.metrics.increment_intermediate_commits();
            tracing::debug!("Injecting intermediate commit of txn {} on shard {}", txn, shard);
            let (_, more) = self.round(&mut log, Operation::intermediate_commit(txn)).await?;
            for follower in more {
                if !dropped.contains(&follower) {
                    dropped.push(follower);
                }
            }
        }

        if dropped.is_empty() {
            Ok(ReplicationOutcome::Committed { seq })
        } else {
            Ok(ReplicationOutcome::PartiallyCommitted { seq, dropped })
        }
    }

    /// One replication round; returns the assigned seq and the followers dropped by it
    async fn round(&self, log: &mut ShardLog, op: Operation) -> Result<(Seq, Vec<String>)> {
        let shard = log.shard().to_string();
        let view = self.registry.view(&shard).await?;
        let seq = log.last_seq() + 1;
        // Durable before the write is visible anywhere; a failed reservation leaves no trace
        self.registry.record_leader_seq(&shard, seq).await?;
        let entry = log.append(OpEntry::new(&shard, seq, view.term, op)).await?;
        if self.config.compaction_due(seq - 1, seq) {
            if let Err(e) = log.compact().await {
                tracing::warn!("Compaction of shard {} failed: {}", shard, e);
            }
        }

        let followers: Vec<String> = view.active_followers().iter().map(|p| p.id.clone()).collect();
        if followers.is_empty() {
            tracing::debug!("Shard {} committed seq {} without followers", shard, seq);
            return Ok((seq, Vec::new()));
        }

        let log = &*log;
        let entry: &OpEntry = &entry;
        let deliveries = join_all(followers.iter().map(|follower| async move {
            let delivery = match tokio::time::timeout(
                self.config.ack_timeout(),
                self.deliver(log, follower, entry),
            )
            .await
            {
                Ok(delivery) => delivery,
                Err(_) => Err(Error::Timeout {
                    shard: entry.header.shard.clone(),
                    follower: follower.clone(),
                    seq,
                }),
            };
            (follower.as_str(), delivery)
        }))
        .await;

        let mut dropped = Vec::new();
        for (follower, delivery) in deliveries {
            let error = match delivery {
                Ok(applied) => {
                    if let Err(e) = self.registry.record_applied(&shard, follower, applied).await {
                        tracing::debug!("Could not record applied index of {}: {}", follower, e);
                    }
                    self.reconciler.observe(&shard, follower, Signal::Ack).await;
                    continue;
                }
                Err(e) => e,
            };
            let Some(signal) = Signal::from_error(&error) else {
                tracing::info!("{} reported {} for seq {}; not counted", follower, error, seq);
                continue;
            };

            tracing::warn!("Follower {} missed seq {} of shard {}: {}", follower, seq, shard, error);
            if let Err(e) = self.registry.record_failure(&shard, follower, &signal.to_string()).await {
                tracing::debug!("Could not record failure of {}: {}", follower, e);
            }
            if self.reconciler.observe(&shard, follower, signal).await == Verdict::Dropped {
                dropped.push(follower.to_string());
            }
        }

        Ok((seq, dropped))
    }

    /// Deliver an entry to one follower, catching it up from the backlog if needed.
    /// Returns the follower's applied index.
    async fn deliver(&self, log: &ShardLog, follower: &str, entry: &OpEntry) -> Result<Seq> {
        let shard = entry.header.shard.as_str();
        let seq = entry.seq();
        let mut resent = false;

        loop {
            let rejection = match self.transport.apply(follower, entry).await? {
                ApplyResponse::Ack { applied_index } => return Ok(applied_index),
                ApplyResponse::Rejected(rejection) => rejection,
            };

            if let Rejection::Gap { expected } = rejection {
                return self.catch_up(log, follower, entry, expected).await;
            }
            let error = rejection_error(shard, follower, entry.op.txn, rejection);
            if !error.is_benign() || resent {
                return Err(error);
            }
            self.metrics.increment_cross_shard_aborts();
            tracing::info!("{} reported {} for seq {}; resending", follower, error, seq);
            resent = true;
        }
    }

    /// Replay backlog entries from `expected` so the buffered entry drains
    async fn catch_up(&self, log: &ShardLog, follower: &str, entry: &OpEntry, expected: Seq) -> Result<Seq> {
        let shard = entry.header.shard.as_str();
        let seq = entry.seq();
        let lagging = || Error::Lagging {
            shard: shard.to_string(),
            follower: follower.to_string(),
            expected,
        };
        let Some(missing) = log.backlog_range(expected, seq.saturating_sub(1)) else {
            tracing::debug!("Backlog no longer holds seq {} for {}", expected, follower);
            return Err(lagging());
        };
        tracing::debug!(
            "Catching up {} on shard {} with {} entries",
            follower,
            shard,
            missing.len()
        );

        let mut applied = expected.saturating_sub(1);
        for missed in missing.iter().map(|e| e.as_ref()).chain(std::iter::once(entry)) {
            if missed.seq() <= applied {
                continue;
            }
            match self.transport.apply(follower, missed).await? {
                ApplyResponse::Ack { applied_index } => applied = applied_index,
                ApplyResponse::Rejected(rejection) => {
                    return Err(rejection_error(shard, follower, missed.op.txn, rejection))
                }
            }
        }

        if applied >= seq {
            Ok(applied)
        } else {
            Err(lagging())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DigestConfig, ReconcileConfig};
    use crate::digest::DigestEngine;
    use crate::replication::{FollowerNode, LocalTransport};
    use crate::state::StateTracker;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Harness {
        leader: LeaderReplicator,
        transport: Arc<LocalTransport>,
        followers: Vec<Arc<FollowerNode>>,
        metrics: Arc<ReplicationMetrics>,
        reconciler: Arc<Reconciler>,
    }

    fn config(threshold: usize) -> ReplicationConfig {
        ReplicationConfig {
            ack_timeout_ms: 500,
            intermediate_commit_threshold: threshold,
            ..Default::default()
        }
    }

    async fn harness(threshold: usize) -> Harness {
        harness_with(config(threshold), None).await
    }

    async fn harness_with(config: ReplicationConfig, tracker: Option<Arc<StateTracker>>) -> Harness {
        let metrics = Arc::new(ReplicationMetrics::new());
        let mut registry = ParticipantRegistry::new(metrics.clone());
        if let Some(tracker) = tracker {
            registry = registry.with_tracker(tracker);
        }
        let registry = Arc::new(registry);
        let followers = vec!["F1".to_string(), "F2".to_string()];
        registry.provision("s1", "L", &followers).await.unwrap();

        let transport = Arc::new(LocalTransport::new());
        let mut nodes = Vec::new();
        for id in &followers {
            let node = Arc::new(FollowerNode::new(id.clone(), &config, Duration::from_secs(60)));
            node.host("s1", Arc::new(MemoryStore::new())).await;
            transport.register(node.clone()).await;
            nodes.push(node);
        }

        let rounds = Arc::new(ShardRounds::new());
        let engine = Arc::new(DigestEngine::new(DigestConfig::default(), metrics.clone()));
        let reconciler = Arc::new(Reconciler::new(
            "L".into(),
            ReconcileConfig::default(),
            registry.clone(),
            rounds.clone(),
            transport.clone(),
            engine,
            metrics.clone(),
        ));
        let leader = LeaderReplicator::new(
            "L".into(),
            config,
            registry,
            rounds,
            transport.clone(),
            reconciler.clone(),
            metrics.clone(),
        );
        leader.lead("s1", Arc::new(MemoryStore::new())).await.unwrap();

        Harness {
            leader,
            transport,
            followers: nodes,
            metrics,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_sequences_are_strictly_increasing() {
        let h = harness(1000).await;
        for i in 1..=3u64 {
            let outcome = h.leader.replicate("s1", Operation::upsert(format!("k{}", i), json!(i))).await;
            assert_eq!(outcome, ReplicationOutcome::Committed { seq: i });
        }
        for node in &h.followers {
            assert_eq!(node.applied_index("s1").await.unwrap(), 3);
        }
        assert_eq!(h.metrics.follower_seq("s1", "F1"), Some(3));
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_not_leader_fails() {
        let h = harness(1000).await;
        let outcome = h.leader.replicate("unknown", Operation::upsert("k", json!(1))).await;
        assert!(matches!(outcome, ReplicationOutcome::Failed { .. }));
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_intermediate_commit_is_injected() {
        let h = harness(2).await;
        let first = h.leader.replicate("s1", Operation::upsert("a", json!(1)).in_txn(9)).await;
        assert_eq!(first.seq(), Some(1));
        let second = h.leader.replicate("s1", Operation::upsert("b", json!(2)).in_txn(9)).await;
        assert_eq!(second.seq(), Some(2));
        // The marker took seq 3
        assert_eq!(h.leader.last_seq("s1").await.unwrap(), 3);
        assert_eq!(h.metrics.intermediate_commits(), 1);

        let store = h.followers[0].store("s1").await.unwrap();
        assert!(store.get("a", 3).await.unwrap().is_some());

        let aborted = h.leader.abort_transaction("s1", 9).await;
        assert!(aborted.is_committed());
        let tag = store.current_tag().await;
        assert!(store.get("a", tag).await.unwrap().is_none());
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_gap_is_caught_up_from_backlog() {
        let h = harness(1000).await;
        h.leader.replicate("s1", Operation::upsert("a", json!(1))).await;

        // F1 misses seq 2 entirely
        h.transport.set_reachable("F1", false).await;
        let outcome = h.leader.replicate("s1", Operation::upsert("b", json!(2))).await;
        assert!(outcome.is_committed());
        h.transport.set_reachable("F1", true).await;

        let outcome = h.leader.replicate("s1", Operation::upsert("c", json!(3))).await;
        assert_eq!(outcome, ReplicationOutcome::Committed { seq: 3 });
        assert_eq!(h.followers[0].applied_index("s1").await.unwrap(), 3);
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_cross_shard_abort_is_not_counted() {
        let h = harness(1000).await;
        h.transport
            .inject_rejection(
                "F1",
                "s1",
                Rejection::TransactionAborted {
                    shard: "s2".into(),
                    txn: 4,
                },
            )
            .await;

        let outcome = h.leader.replicate("s1", Operation::upsert("k", json!(1)).in_txn(4)).await;
        assert_eq!(outcome, ReplicationOutcome::Committed { seq: 1 });
        assert_eq!(h.metrics.cross_shard_aborts(), 1);
        assert_eq!(
            h.reconciler.state("s1", "F1").await,
            crate::reconcile::PairState::InSync
        );
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_unpersisted_seq_is_never_applied() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(StateTracker::new(dir.path().to_path_buf(), "L".into()).unwrap());
        let h = harness_with(config(1000), Some(tracker.clone())).await;
        let first = h.leader.replicate("s1", Operation::upsert("k1", json!(1))).await;
        assert_eq!(first, ReplicationOutcome::Committed { seq: 1 });

        tracker.break_shard_table().await;
        let second = h.leader.replicate("s1", Operation::upsert("k2", json!(2))).await;
        assert!(matches!(second, ReplicationOutcome::Failed { .. }));

        // A failed outcome means the write is nowhere
        let store = h.leader.rounds.store("s1").await.unwrap();
        assert!(store.get("k2", store.current_tag().await).await.unwrap().is_none());
        assert_eq!(h.leader.last_seq("s1").await.unwrap(), 1);
        for node in &h.followers {
            assert_eq!(node.applied_index("s1").await.unwrap(), 1);
        }
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_pinned_snapshot_survives_compaction() {
        let config = ReplicationConfig {
            compaction_interval: 2,
            ..config(1000)
        };
        let h = harness_with(config, None).await;
        h.leader.replicate("s1", Operation::upsert("k", json!(1))).await;
        let pin = h.leader.rounds.lock("s1").await.unwrap().pin();
        assert_eq!(pin.tag(), 1);

        for v in 2..=4 {
            h.leader.replicate("s1", Operation::upsert("k", json!(v))).await;
        }
        let store = h.leader.rounds.store("s1").await.unwrap();
        assert_eq!(store.get("k", 1).await.unwrap().unwrap().body, json!(1));

        drop(pin);
        for v in 5..=6 {
            h.leader.replicate("s1", Operation::upsert("k", json!(v))).await;
        }
        assert!(store.get("k", 1).await.unwrap().is_none());
        assert_eq!(store.get("k", 6).await.unwrap().unwrap().body, json!(6));
        h.reconciler.shutdown();
    }

    #[test]
    fn test_rejections_map_to_signals() {
        let hard = rejection_error("s1", "F1", None, Rejection::StaleTerm { term: 4 });
        assert!(matches!(
            Signal::from_error(&hard),
            Some(Signal::HardRejection { .. })
        ));

        let lagging = rejection_error("s1", "F1", None, Rejection::Lagging { expected: 2 });
        assert_eq!(Signal::from_error(&lagging), Some(Signal::Lagging));

        let foreign = rejection_error(
            "s1",
            "F1",
            Some(4),
            Rejection::TransactionAborted {
                shard: "s2".into(),
                txn: 4,
            },
        );
        assert_eq!(Signal::from_error(&foreign), None);

        // The entry's own transaction aborted on its own shard is not a race
        let own = rejection_error(
            "s1",
            "F1",
            Some(4),
            Rejection::TransactionAborted {
                shard: "s1".into(),
                txn: 4,
            },
        );
        assert!(matches!(
            Signal::from_error(&own),
            Some(Signal::Incompatible { .. })
        ));

        let unreachable = Error::ConnectionFailed {
            address: "F1".into(),
            reason: "unreachable".into(),
        };
        assert_eq!(Signal::from_error(&unreachable), Some(Signal::Timeout));
    }
}
