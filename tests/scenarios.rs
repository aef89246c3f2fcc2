//! End-to-end replication and reconciliation scenarios over the in-process
//! transport: one leader `L` and followers `F1`, `F2` for shard `s1`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;

use wolfshard::config::WolfShardConfig;
use wolfshard::digest::{KeyRange, RebuildReason};
use wolfshard::error::Error;
use wolfshard::node::ShardNode;
use wolfshard::reconcile::{PairState, RemoteDigestSource};
use wolfshard::replication::{FollowerNode, LocalTransport, ReplicaTransport, Rejection, ReplicationOutcome};
use wolfshard::state::StateTracker;
use wolfshard::store::{DigestEntry, Document, DocumentStore, MemoryStore, Operation, Seq};

const CONFIG: &str = r#"
[node]
id = "L"
bind_address = "127.0.0.1:0"

[replication]
ack_timeout_ms = 300

[reconcile]
suspicion_budget = 2
resync_ttl_ms = 10000
restart_backoff_ms = 20

[[peers]]
id = "F1"
address = "127.0.0.1:7701"

[[peers]]
id = "F2"
address = "127.0.0.1:7702"

[[shards]]
id = "s1"
leader = "L"
followers = ["F1", "F2"]
"#;

struct Cluster {
    node: Arc<ShardNode>,
    transport: Arc<LocalTransport>,
    f1: Arc<FollowerNode>,
    f2: Arc<FollowerNode>,
}

async fn follower(config: &WolfShardConfig, id: &str, transport: &LocalTransport) -> Arc<FollowerNode> {
    let node = Arc::new(FollowerNode::new(
        id.to_string(),
        &config.replication,
        config.digest.batch_ttl(),
    ));
    node.host("s1", Arc::new(MemoryStore::new())).await;
    transport.register(node.clone()).await;
    node
}

async fn cluster_with(tracker: Option<Arc<StateTracker>>) -> Cluster {
    cluster_from(CONFIG, tracker).await
}

async fn cluster_from(config: &str, tracker: Option<Arc<StateTracker>>) -> Cluster {
    let config = WolfShardConfig::parse(config).unwrap();
    let transport = Arc::new(LocalTransport::new());
    let f1 = follower(&config, "F1", &transport).await;
    let f2 = follower(&config, "F2", &transport).await;

    let node = Arc::new(ShardNode::new(config, transport.clone(), tracker, None));
    node.bootstrap().await.unwrap();
    Cluster {
        node,
        transport,
        f1,
        f2,
    }
}

async fn cluster() -> Cluster {
    cluster_with(None).await
}

fn upsert(key: &str, n: u64) -> Operation {
    Operation::upsert(key, json!({ "n": n }))
}

/// Wait until a follower is back in the replication set
async fn wait_in_sync(node: &ShardNode, follower: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let state = node.reconciler.state("s1", follower).await;
            let view = node.registry.view("s1").await.unwrap();
            if state == PairState::InSync && !view.followers[follower].excluded {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("follower never returned to the replication set");
}

/// Digest comparison of the leader copy against a follower at the leader's tag
async fn divergent_ranges(cluster: &Cluster, follower: &str) -> usize {
    let node = &cluster.node;
    let store = node.rounds.store("s1").await.unwrap();
    let tag = store.current_tag().await;
    let batch = cluster.transport.open_batch(follower, "s1").await.unwrap();
    let remote = RemoteDigestSource::new(cluster.transport.clone(), follower, &batch.id);
    let divergent = node
        .engine
        .compare_remote("s1", store.as_ref(), tag, &remote)
        .await
        .unwrap();
    cluster.transport.close_batch(follower, &batch.id).await.unwrap();
    divergent.len()
}

#[tokio::test]
async fn test_healthy_replication_converges() {
    let c = cluster().await;

    for i in 1..=3u64 {
        let outcome = c.node.leader.replicate("s1", upsert(&format!("k{}", i), i)).await;
        assert_eq!(outcome, ReplicationOutcome::Committed { seq: i });
    }

    for f in [&c.f1, &c.f2] {
        assert_eq!(f.applied_index("s1").await.unwrap(), 3);
    }
    assert_eq!(divergent_ranges(&c, "F1").await, 0);
    assert_eq!(divergent_ranges(&c, "F2").await, 0);
    assert_eq!(c.node.metrics.dropped_followers(), 0);
    c.node.shutdown();
}

#[tokio::test]
async fn test_unreachable_follower_is_dropped_and_resynced() {
    let c = cluster().await;

    let outcome = c.node.leader.replicate("s1", upsert("k1", 1)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 1 });

    c.transport.set_reachable("F2", false).await;
    let outcome = c.node.leader.replicate("s1", upsert("k2", 2)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 2 });
    assert_eq!(
        c.node.reconciler.state("s1", "F2").await,
        PairState::Suspect { misses: 1 }
    );

    let generation = c.node.registry.view("s1").await.unwrap().generation;
    let outcome = c.node.leader.replicate("s1", upsert("k3", 3)).await;
    assert_eq!(
        outcome,
        ReplicationOutcome::PartiallyCommitted {
            seq: 3,
            dropped: vec!["F2".to_string()],
        }
    );
    let view = c.node.registry.view("s1").await.unwrap();
    assert!(view.followers["F2"].excluded);
    assert!(view.generation > generation);
    assert_eq!(c.node.metrics.dropped_followers(), 1);

    // Writes keep committing on the remaining follower
    let outcome = c.node.leader.replicate("s1", Operation::remove("k1")).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 4 });

    c.transport.set_reachable("F2", true).await;
    wait_in_sync(&c.node, "F2").await;

    assert_eq!(c.f2.applied_index("s1").await.unwrap(), 4);
    assert_eq!(divergent_ranges(&c, "F2").await, 0);
    let store = c.f2.store("s1").await.unwrap();
    assert!(store.get("k1", 4).await.unwrap().is_none());
    assert_eq!(store.get("k3", 4).await.unwrap().unwrap().body, json!({ "n": 3 }));
    assert!(c.node.metrics.resync_successes() >= 1);

    // Re-admitted follower takes part in the next round again
    let outcome = c.node.leader.replicate("s1", upsert("k5", 5)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 5 });
    assert_eq!(c.f2.applied_index("s1").await.unwrap(), 5);
    c.node.shutdown();
}

#[tokio::test]
async fn test_cross_shard_abort_does_not_count_against_follower() {
    let c = cluster().await;
    c.transport
        .inject_rejection(
            "F1",
            "s1",
            Rejection::TransactionAborted {
                shard: "s2".into(),
                txn: 7,
            },
        )
        .await;

    let outcome = c.node.leader.replicate("s1", upsert("k1", 1)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 1 });
    assert_eq!(c.node.reconciler.state("s1", "F1").await, PairState::InSync);
    assert!(!c.node.registry.view("s1").await.unwrap().followers["F1"].excluded);
    assert_eq!(c.node.metrics.cross_shard_aborts(), 1);
    assert_eq!(c.node.metrics.dropped_followers(), 0);
    c.node.shutdown();
}

#[tokio::test]
async fn test_hard_rejection_drops_immediately() {
    let c = cluster().await;
    c.transport
        .inject_rejection(
            "F1",
            "s1",
            Rejection::Hard {
                reason: "disk full".into(),
            },
        )
        .await;

    let outcome = c.node.leader.replicate("s1", upsert("k1", 1)).await;
    assert_eq!(
        outcome,
        ReplicationOutcome::PartiallyCommitted {
            seq: 1,
            dropped: vec!["F1".to_string()],
        }
    );
    assert_eq!(c.node.metrics.dropped_followers(), 1);

    wait_in_sync(&c.node, "F1").await;
    assert_eq!(c.f1.applied_index("s1").await.unwrap(), 1);
    c.node.shutdown();
}

#[tokio::test]
async fn test_corruption_at_same_tag_rebuilds_once() {
    let c = cluster().await;
    for i in 1..=3u64 {
        c.node.leader.replicate("s1", upsert(&format!("k{}", i), i)).await;
    }
    assert_eq!(divergent_ranges(&c, "F1").await, 0);
    assert_eq!(c.node.metrics.tree_rebuilds(), 0);

    // Rewrite the leader copy underneath the cached tree without moving its tag
    let store = c.node.rounds.store("s1").await.unwrap();
    store
        .put(
            Document {
                key: "stray".into(),
                revision: 3,
                body: json!(null),
            },
            3,
        )
        .await
        .unwrap();

    assert!(divergent_ranges(&c, "F1").await > 0);
    assert_eq!(c.node.metrics.tree_rebuilds(), 1);
    divergent_ranges(&c, "F1").await;
    assert_eq!(c.node.metrics.tree_rebuilds(), 1);
    c.node.shutdown();
}

#[tokio::test]
async fn test_empty_leader_truncates_resyncing_follower() {
    let c = cluster().await;
    let store = c.f2.store("s1").await.unwrap();
    store
        .put(
            Document {
                key: "ghost".into(),
                revision: 1,
                body: json!("boo"),
            },
            0,
        )
        .await
        .unwrap();

    c.node.registry.drop_follower("s1", "F2").await.unwrap();
    assert_eq!(c.node.reconciler.resume_excluded("s1").await.unwrap(), 1);
    wait_in_sync(&c.node, "F2").await;

    assert_eq!(store.count(store.current_tag().await).await.unwrap(), 0);
    c.node.shutdown();
}

#[tokio::test]
async fn test_stale_generation_admission_is_rejected() {
    let c = cluster().await;
    let before = c.node.registry.view("s1").await.unwrap().generation;
    let dropped = c.node.registry.drop_follower("s1", "F1").await.unwrap();
    assert_eq!(dropped, before + 1);

    // Dropping an excluded follower again changes nothing
    assert_eq!(c.node.registry.drop_follower("s1", "F1").await.unwrap(), dropped);

    let result = c.node.registry.admit("s1", "F1", before).await;
    assert!(matches!(result, Err(Error::StaleGeneration { .. })));
    assert!(c.node.registry.view("s1").await.unwrap().followers["F1"].excluded);

    let admitted = c.node.registry.admit("s1", "F1", dropped).await.unwrap();
    assert_eq!(admitted, dropped + 1);
    c.node.shutdown();
}

#[tokio::test]
async fn test_resync_request_for_in_sync_pair_is_noop() {
    let c = cluster().await;
    assert!(!c.node.reconciler.request_resync("s1", "F1").await);
    assert!(!c.node.reconciler.resync_running("s1", "F1").await);
    assert!(c.node.reconciler.unsettled("s1").await.is_empty());
    c.node.shutdown();
}

#[tokio::test]
async fn test_restart_behind_persisted_seq_resyncs_followers() {
    let dir = tempdir().unwrap();
    let tracker = Arc::new(StateTracker::new(dir.path().to_path_buf(), "L".into()).unwrap());

    let c = cluster_with(Some(tracker)).await;
    for i in 1..=3u64 {
        c.node.leader.replicate("s1", upsert(&format!("k{}", i), i)).await;
    }
    c.node.shutdown();
    let followers = (c.f1.clone(), c.f2.clone());
    let transport = c.transport.clone();
    drop(c);

    // Same followers, fresh and empty leader copy
    let config = WolfShardConfig::parse(CONFIG).unwrap();
    let tracker = Arc::new(StateTracker::new(dir.path().to_path_buf(), "L".into()).unwrap());
    let node = Arc::new(ShardNode::new(config, transport.clone(), Some(tracker), None));
    node.bootstrap().await.unwrap();

    let view = node.registry.view("s1").await.unwrap();
    assert_eq!(view.leader_seq(), 3);
    wait_in_sync(&node, "F1").await;
    wait_in_sync(&node, "F2").await;

    let outcome = node.leader.replicate("s1", upsert("k4", 4)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 4 });
    for f in [&followers.0, &followers.1] {
        let store = f.store("s1").await.unwrap();
        assert!(store.get("k1", 4).await.unwrap().is_none());
        assert!(store.get("k4", 4).await.unwrap().is_some());
    }
    node.shutdown();
}

#[tokio::test]
async fn test_fresh_admission_rebuild_is_counted() {
    let c = cluster().await;
    c.node.leader.replicate("s1", upsert("k1", 1)).await;
    let store = c.node.rounds.store("s1").await.unwrap();
    c.node
        .engine
        .rebuild("s1", store.as_ref(), 1, RebuildReason::FreshAdmission)
        .await
        .unwrap();
    assert_eq!(c.node.metrics.tree_rebuilds(), 1);
    c.node.shutdown();
}

#[tokio::test]
async fn test_resync_attempt_past_its_ttl_is_restarted() {
    let config = CONFIG.replace("resync_ttl_ms = 10000", "resync_ttl_ms = 150");
    let c = cluster_from(&config, None).await;
    for i in 1..=3u64 {
        c.node.leader.replicate("s1", upsert(&format!("k{}", i), i)).await;
    }

    // Fencing and pinning alone outlast the TTL
    c.transport.set_latency("F2", Duration::from_millis(100)).await;
    c.node.registry.drop_follower("s1", "F2").await.unwrap();
    c.node.reconciler.resume_excluded("s1").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while c.node.metrics.resync_timeouts() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("resync attempt never expired");
    assert!(c.node.registry.view("s1").await.unwrap().followers["F2"].excluded);

    c.transport.set_latency("F2", Duration::ZERO).await;
    wait_in_sync(&c.node, "F2").await;
    assert!(c.node.metrics.resync_attempts() >= 2);
    assert!(c.node.metrics.resync_successes() >= 1);
    assert_eq!(c.f2.applied_index("s1").await.unwrap(), 3);
    assert_eq!(divergent_ranges(&c, "F2").await, 0);
    c.node.shutdown();
}

/// Memory store whose tag advances can be slowed down on demand
struct StallingStore {
    inner: MemoryStore,
    slow: AtomicBool,
}

#[async_trait]
impl DocumentStore for StallingStore {
    async fn current_tag(&self) -> Seq {
        self.inner.current_tag().await
    }

    async fn advance_tag(&self, tag: Seq) -> wolfshard::error::Result<()> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.advance_tag(tag).await
    }

    async fn get(&self, key: &str, tag: Seq) -> wolfshard::error::Result<Option<Document>> {
        self.inner.get(key, tag).await
    }

    async fn put(&self, doc: Document, tag: Seq) -> wolfshard::error::Result<()> {
        self.inner.put(doc, tag).await
    }

    async fn remove(&self, key: &str, tag: Seq) -> wolfshard::error::Result<()> {
        self.inner.remove(key, tag).await
    }

    async fn scan(&self, range: KeyRange, tag: Seq) -> wolfshard::error::Result<Vec<DigestEntry>> {
        self.inner.scan(range, tag).await
    }

    async fn count(&self, tag: Seq) -> wolfshard::error::Result<u64> {
        self.inner.count(tag).await
    }

    async fn truncate(&self, tag: Seq) -> wolfshard::error::Result<u64> {
        self.inner.truncate(tag).await
    }

    async fn compact(&self, horizon: Seq) -> wolfshard::error::Result<usize> {
        self.inner.compact(horizon).await
    }
}

#[tokio::test]
async fn test_abort_on_other_shard_races_write_on_this_shard() {
    let config = format!(
        "{}\n[[shards]]\nid = \"s2\"\nleader = \"L\"\nfollowers = [\"F1\"]\n",
        CONFIG
    );
    let config = WolfShardConfig::parse(&config).unwrap();
    let transport = Arc::new(LocalTransport::new());
    let f1 = follower(&config, "F1", &transport).await;
    let stalling = Arc::new(StallingStore {
        inner: MemoryStore::new(),
        slow: AtomicBool::new(false),
    });
    f1.host("s2", stalling.clone()).await;
    follower(&config, "F2", &transport).await;
    let node = Arc::new(ShardNode::new(config, transport.clone(), None, None));
    node.bootstrap().await.unwrap();

    let outcome = node.leader.replicate("s2", upsert("t", 1).in_txn(7)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 1 });

    // F1 is still unwinding txn 7 on s2 when the s1 write of txn 7 arrives
    stalling.slow.store(true, Ordering::SeqCst);
    let abort = {
        let node = node.clone();
        tokio::spawn(async move { node.leader.abort_transaction("s2", 7).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = node.leader.replicate("s1", upsert("k1", 1).in_txn(7)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 1 });
    assert_eq!(node.metrics.cross_shard_aborts(), 1);
    assert_eq!(node.metrics.dropped_followers(), 0);
    assert_eq!(node.reconciler.state("s1", "F1").await, PairState::InSync);
    assert!(!node.registry.view("s1").await.unwrap().followers["F1"].excluded);

    assert_eq!(abort.await.unwrap(), ReplicationOutcome::Committed { seq: 2 });
    stalling.slow.store(false, Ordering::SeqCst);

    // The next write carries F1 over the entry it could not take
    let outcome = node.leader.replicate("s1", upsert("k2", 2)).await;
    assert_eq!(outcome, ReplicationOutcome::Committed { seq: 2 });
    assert_eq!(f1.applied_index("s1").await.unwrap(), 2);
    node.shutdown();
}

#[tokio::test]
async fn test_decommission_stops_everything_for_the_shard() {
    let dir = tempdir().unwrap();
    let tracker = Arc::new(StateTracker::new(dir.path().to_path_buf(), "L".into()).unwrap());
    let c = cluster_with(Some(tracker.clone())).await;
    c.node.leader.replicate("s1", upsert("k1", 1)).await;
    assert_eq!(divergent_ranges(&c, "F1").await, 0);

    c.transport.set_reachable("F2", false).await;
    c.node.registry.drop_follower("s1", "F2").await.unwrap();
    c.node.reconciler.resume_excluded("s1").await.unwrap();
    assert!(c.node.reconciler.resync_running("s1", "F2").await);

    c.node.decommission("s1").await.unwrap();
    assert!(!c.node.reconciler.resync_running("s1", "F2").await);
    assert!(c.node.reconciler.unsettled("s1").await.is_empty());
    assert!(c.node.rounds.shards().await.is_empty());
    assert!(!c.node.engine.forget("s1").await);
    assert_eq!(tracker.shard_generation("s1").await.unwrap(), None);

    let outcome = c.node.leader.replicate("s1", upsert("k2", 2)).await;
    assert!(matches!(outcome, ReplicationOutcome::Failed { .. }));
    let again = c.node.decommission("s1").await;
    assert!(matches!(again, Err(Error::ShardNotFound(_))));
    c.node.shutdown();
}
