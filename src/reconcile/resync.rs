//! Background resynchronization of dropped followers
//!
//! One task per (shard, follower). Each attempt fences the follower,
//! compares digest trees against it and pushes repairs until two
//! consecutive comparisons come back clean, the second one under the round
//! lock so no operation slips in between comparison and admission.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::machine::{Event, PairState, CLEAN_PASSES_REQUIRED};
use super::manager::Reconciler;
use crate::digest::{BucketDigest, DigestSource, KeyRange, RebuildReason, StoreDigestSource};
use crate::error::{Error, Result};
use crate::replication::{ReplicaTransport, Readmission, RepairBatch};
use crate::store::{DigestEntry, DocumentStore, Seq};

/// Leaves repaired between two keepalives of the comparison batch
const KEEPALIVE_EVERY_LEAVES: usize = 32;

/// Digests served by a follower inside a comparison batch
pub struct RemoteDigestSource {
    transport: Arc<dyn ReplicaTransport>,
    follower: String,
    batch_id: String,
}

impl RemoteDigestSource {
    pub fn new(transport: Arc<dyn ReplicaTransport>, follower: &str, batch_id: &str) -> Self {
        Self {
            transport,
            follower: follower.to_string(),
            batch_id: batch_id.to_string(),
        }
    }
}

#[async_trait]
impl DigestSource for RemoteDigestSource {
    async fn digest(&self, range: KeyRange, parts: usize) -> Result<Vec<BucketDigest>> {
        self.transport
            .digest_range(&self.follower, &self.batch_id, range, parts)
            .await
    }
}

/// How an attempt ended
enum AttemptOutcome {
    Admitted,
    /// The follower is no longer ours to resync
    Abandoned,
}

/// Outcome of one comparison pass
struct PassReport {
    diverged: bool,
    repaired: usize,
}

impl Reconciler {
    pub(super) async fn run_resync(self: Arc<Self>, shard: String, follower: String, token: CancellationToken) {
        loop {
            if token.is_cancelled() || self.is_shutting_down() {
                tracing::debug!("Resync of {} for shard {} cancelled", follower, shard);
                return;
            }

            self.metrics.increment_resync_attempts();
            let attempt = match self.state(&shard, &follower).await {
                PairState::Resyncing { attempt, .. } => attempt,
                _ => 1,
            };
            tracing::info!(
                "Resync attempt {} of {} for shard {}",
                attempt,
                follower,
                shard
            );

            let ttl = self.config.resync_ttl();
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::time::timeout(ttl, self.attempt(&shard, &follower, &token)) => result,
            };

            let error = match result {
                Ok(Ok(AttemptOutcome::Admitted)) => {
                    self.metrics.increment_resync_successes();
                    tracing::info!("{} re-admitted to shard {}", follower, shard);
                    return;
                }
                Ok(Ok(AttemptOutcome::Abandoned)) => {
                    tracing::info!("Resync of {} for shard {} abandoned", follower, shard);
                    return;
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    self.metrics.increment_resync_timeouts();
                    Error::ResyncTimeout {
                        shard: shard.clone(),
                        follower: follower.clone(),
                    }
                }
            };

            if token.is_cancelled() {
                return;
            }
            tracing::warn!(
                "Resync attempt {} of {} for shard {} failed: {}",
                attempt,
                follower,
                shard,
                error
            );
            self.apply_event(&shard, &follower, Event::ResyncExpired).await;

            let backoff = self.config.restart_backoff() * attempt.min(10);
            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
            let backoff = backoff + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn attempt(&self, shard: &str, follower: &str, token: &CancellationToken) -> Result<AttemptOutcome> {
        let view = self.registry.view(shard).await?;
        if !view.role_of(&self.node_id).is_some_and(|r| r.authoritative_for_repair()) {
            return Ok(AttemptOutcome::Abandoned);
        }
        let Some(participant) = view.followers.get(follower) else {
            return Ok(AttemptOutcome::Abandoned);
        };
        let generation = view.generation;
        if !participant.excluded {
            self.apply_event(shard, follower, Event::Admitted).await;
            return Ok(AttemptOutcome::Admitted);
        }

        self.transport.fence(follower, shard, generation).await?;

        for pass in 1..=self.config.max_passes.max(1) {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let current = self.registry.view(shard).await?.generation;
            if current != generation {
                return Err(Error::StaleGeneration {
                    shard: shard.to_string(),
                    expected: generation,
                    current,
                });
            }

            let clean_so_far = self.state(shard, follower).await.clean_passes();
            if clean_so_far + 1 >= CLEAN_PASSES_REQUIRED {
                if self.final_pass(shard, follower, generation).await? {
                    return Ok(AttemptOutcome::Admitted);
                }
                continue;
            }

            let (store, pin) = {
                let log = self.rounds.lock(shard).await?;
                (log.store(), log.pin())
            };
            let report = self.compare_pass(shard, follower, store, pin.tag()).await?;
            drop(pin);
            tracing::debug!(
                "Pass {} of {} for shard {}: diverged={}, repaired {}",
                pass,
                follower,
                shard,
                report.diverged,
                report.repaired
            );
            let event = if report.diverged {
                Event::ComparisonDiverged
            } else {
                Event::ComparisonClean
            };
            self.apply_event(shard, follower, event).await;
        }

        Err(Error::Internal(format!(
            "{} did not converge on shard {} within {} passes",
            follower, shard, self.config.max_passes
        )))
    }

    /// Last comparison, under the round lock. Admits the follower when clean.
    async fn final_pass(&self, shard: &str, follower: &str, generation: u64) -> Result<bool> {
        let log = self.rounds.lock(shard).await?;
        let store = log.store();
        let tag = log.last_seq();

        let report = self.compare_pass(shard, follower, store.clone(), tag).await?;
        if report.diverged {
            tracing::debug!(
                "Final pass of {} for shard {} repaired {} documents",
                follower,
                shard,
                report.repaired
            );
            self.apply_event(shard, follower, Event::ComparisonDiverged).await;
            return Ok(false);
        }
        self.apply_event(shard, follower, Event::ComparisonClean).await;

        let admitted = self.registry.admit(shard, follower, generation).await?;
        let view = self.registry.view(shard).await?;
        let readmission = Readmission {
            shard: shard.to_string(),
            generation: admitted,
            term: view.term,
            applied_index: tag,
            open_txns: log.applier().export_open(),
        };
        if let Err(e) = self.transport.readmit(follower, readmission).await {
            // Admitted in the registry but the follower never heard of it
            self.registry.drop_follower(shard, follower).await?;
            return Err(e);
        }
        self.registry.record_applied(shard, follower, tag).await?;
        drop(log);

        if let Err(e) = self
            .engine
            .rebuild(shard, store.as_ref(), tag, RebuildReason::FreshAdmission)
            .await
        {
            tracing::warn!("Digest rebuild after admitting {} failed: {}", follower, e);
        }
        self.apply_event(shard, follower, Event::Admitted).await;
        Ok(true)
    }

    /// Compare the follower against the leader store at `tag` and repair every divergent leaf
    async fn compare_pass(
        &self,
        shard: &str,
        follower: &str,
        store: Arc<dyn DocumentStore>,
        tag: Seq,
    ) -> Result<PassReport> {
        let batch = self.transport.open_batch(follower, shard).await?;
        let result = self.compare_in_batch(shard, follower, store, tag, &batch.id).await;
        if let Err(e) = self.transport.close_batch(follower, &batch.id).await {
            tracing::debug!("Closing batch {} on {} failed: {}", batch.id, follower, e);
        }
        result
    }

    async fn compare_in_batch(
        &self,
        shard: &str,
        follower: &str,
        store: Arc<dyn DocumentStore>,
        tag: Seq,
        batch_id: &str,
    ) -> Result<PassReport> {
        let remote = RemoteDigestSource::new(self.transport.clone(), follower, batch_id);
        let tree = self.engine.tree(shard, store.as_ref(), tag).await?;
        let divergent = self
            .engine
            .compare_remote(shard, store.as_ref(), tag, &remote)
            .await?;
        if divergent.is_empty() {
            return Ok(PassReport {
                diverged: false,
                repaired: 0,
            });
        }

        if tree.count() == 0 {
            let removed = self.transport.truncate(follower, shard, tag).await?;
            tracing::info!(
                "Leader copy of shard {} is empty, truncated {} documents on {}",
                shard,
                removed,
                follower
            );
            return Ok(PassReport {
                diverged: true,
                repaired: removed as usize,
            });
        }

        let local = StoreDigestSource::new(store.clone(), tag);
        let located = self.engine.locator().locate(&local, &remote, divergent).await?;
        self.transport.keepalive_batch(follower, batch_id).await?;
        tracing::debug!(
            "Located {} divergent leaves of shard {} on {} ({} ranges examined)",
            located.leaves.len(),
            shard,
            follower,
            located.ranges_examined
        );

        let mut batch = RepairBatch::new(shard, tag);
        let mut repaired = 0;
        let chunk = self.config.repair_batch_size.max(1);
        for (i, leaf) in located.leaves.into_iter().enumerate() {
            if i > 0 && i % KEEPALIVE_EVERY_LEAVES == 0 {
                self.transport.keepalive_batch(follower, batch_id).await?;
            }
            let ours = store.scan(leaf, tag).await?;
            let theirs = self.transport.scan_range(follower, batch_id, leaf).await?;
            let (upserts, removals) = diff_leaf(&ours, &theirs);

            for key in upserts {
                if let Some(doc) = store.get(&key, tag).await? {
                    batch.upserts.push(doc);
                }
                if batch.len() >= chunk {
                    repaired += self.send_repair(follower, &mut batch).await?;
                }
            }
            for key in removals {
                batch.removals.push(key);
                if batch.len() >= chunk {
                    repaired += self.send_repair(follower, &mut batch).await?;
                }
            }
        }
        repaired += self.send_repair(follower, &mut batch).await?;

        Ok(PassReport {
            diverged: true,
            repaired,
        })
    }

    async fn send_repair(&self, follower: &str, batch: &mut RepairBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let next = RepairBatch::new(&batch.shard, batch.tag);
        let full = std::mem::replace(batch, next);
        let len = full.len();
        self.transport.repair(follower, full).await?;
        Ok(len)
    }
}

/// Keys to push to and remove from the follower so its leaf matches ours
fn diff_leaf(ours: &[DigestEntry], theirs: &[DigestEntry]) -> (Vec<String>, Vec<String>) {
    let ours: BTreeMap<&str, u64> = ours.iter().map(|e| (e.key.as_str(), e.revision)).collect();
    let theirs: BTreeMap<&str, u64> = theirs.iter().map(|e| (e.key.as_str(), e.revision)).collect();

    let upserts = ours
        .iter()
        .filter(|(key, revision)| theirs.get(*key) != Some(*revision))
        .map(|(key, _)| key.to_string())
        .collect();
    let removals = theirs
        .keys()
        .filter(|key| !ours.contains_key(*key))
        .map(|key| key.to_string())
        .collect();
    (upserts, removals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DigestConfig, ReconcileConfig, ReplicationConfig};
    use crate::digest::DigestEngine;
    use crate::metrics::ReplicationMetrics;
    use crate::replication::{FollowerNode, LocalTransport, ShardRounds};
    use crate::state::ParticipantRegistry;
    use crate::store::{MemoryStore, OpEntry, Operation};
    use serde_json::json;

    struct Harness {
        reconciler: Arc<Reconciler>,
        registry: Arc<ParticipantRegistry>,
        transport: Arc<LocalTransport>,
    }

    /// Leader `L` holding `docs` documents, `F1` empty and dropped, `F2` in sync
    async fn harness(digest: DigestConfig, docs: u64) -> Harness {
        let metrics = Arc::new(ReplicationMetrics::new());
        let registry = Arc::new(ParticipantRegistry::new(metrics.clone()));
        registry
            .provision("s1", "L", &["F1".to_string(), "F2".to_string()])
            .await
            .unwrap();

        let transport = Arc::new(LocalTransport::new());
        let follower = Arc::new(FollowerNode::new(
            "F1".into(),
            &ReplicationConfig::default(),
            Duration::from_secs(60),
        ));
        follower.host("s1", Arc::new(MemoryStore::new())).await;
        transport.register(follower).await;

        let rounds = Arc::new(ShardRounds::new());
        rounds.open("s1", Arc::new(MemoryStore::new()), 64).await;
        {
            let mut log = rounds.lock("s1").await.unwrap();
            for seq in 1..=docs {
                let op = Operation::upsert(format!("k{}", seq), json!(seq));
                log.append(OpEntry::new("s1", seq, 1, op)).await.unwrap();
            }
        }
        registry.record_leader_seq("s1", docs).await.unwrap();
        registry.drop_follower("s1", "F1").await.unwrap();

        let engine = Arc::new(DigestEngine::new(digest, metrics.clone()));
        let reconciler = Arc::new(Reconciler::new(
            "L".into(),
            ReconcileConfig::default(),
            registry.clone(),
            rounds,
            transport.clone(),
            engine,
            metrics,
        ));
        Harness {
            reconciler,
            registry,
            transport,
        }
    }

    #[tokio::test]
    async fn test_long_repair_keeps_the_batch_alive() {
        let digest = DigestConfig {
            leaf_rows: 4,
            ..Default::default()
        };
        let h = harness(digest, 600).await;
        h.transport.fence("F1", "s1", 2).await.unwrap();

        let store = h.reconciler.rounds.store("s1").await.unwrap();
        let report = h.reconciler.compare_pass("s1", "F1", store, 600).await.unwrap();
        assert!(report.diverged);
        assert_eq!(report.repaired, 600);
        // Once after locating, then again every KEEPALIVE_EVERY_LEAVES leaves
        assert!(h.transport.keepalives() >= 2);
        h.reconciler.shutdown();
    }

    #[tokio::test]
    async fn test_generation_change_discards_attempt() {
        let h = harness(DigestConfig::default(), 10).await;
        h.transport.set_latency("F1", Duration::from_millis(200)).await;

        let attempt = {
            let reconciler = h.reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .attempt("s1", "F1", &CancellationToken::new())
                    .await
                    .map(|_| ())
            })
        };
        // Lands while the follower is still being fenced
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.registry.drop_follower("s1", "F2").await.unwrap();

        let result = attempt.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::StaleGeneration {
                expected: 2,
                current: 3,
                ..
            })
        ));
        assert!(h.registry.view("s1").await.unwrap().followers["F1"].excluded);
        h.reconciler.shutdown();
    }

    fn entry(key: &str, revision: u64) -> DigestEntry {
        DigestEntry {
            position: crate::store::key_position(key),
            key: key.to_string(),
            revision,
        }
    }

    #[test]
    fn test_diff_leaf() {
        let ours = vec![entry("a", 1), entry("b", 2), entry("c", 3)];
        let theirs = vec![entry("a", 1), entry("b", 1), entry("d", 4)];
        let (upserts, removals) = diff_leaf(&ours, &theirs);
        assert_eq!(upserts, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(removals, vec!["d".to_string()]);
    }

    #[test]
    fn test_identical_leaves_need_nothing() {
        let ours = vec![entry("a", 1)];
        let (upserts, removals) = diff_leaf(&ours, &ours);
        assert!(upserts.is_empty());
        assert!(removals.is_empty());
    }
}
