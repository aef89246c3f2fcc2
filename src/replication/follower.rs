//! Follower Node Implementation
//!
//! Applies replicated operations in strictly increasing sequence order,
//! buffers a bounded gap of early arrivals, refuses work while fenced, and
//! serves the digest and repair requests of a resynchronizing leader.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use super::protocol::{ApplyResponse, Message, Readmission, Rejection, RepairBatch};
use crate::config::ReplicationConfig;
use crate::digest::{digest_range, BatchInfo, BucketDigest, DigestSessions, KeyRange, MAX_BUCKETS};
use crate::error::{Error, Result};
use crate::store::{DigestEntry, DocumentStore, MemoryStore, OpEntry, OpKind, Seq, TxnApplier, TxnId};

/// Follower copy of one shard
struct Replica {
    store: Arc<dyn DocumentStore>,
    applier: TxnApplier,
    /// Next sequence number to apply
    next_seq: Seq,
    term: u64,
    /// Early arrivals waiting for the gap to close
    pending: BTreeMap<Seq, OpEntry>,
    gap_since: Option<Instant>,
    /// Generation the replica was fenced at
    fenced: Option<u64>,
}

impl Replica {
    async fn new(store: Arc<dyn DocumentStore>, fenced: Option<u64>) -> Self {
        let next_seq = store.current_tag().await + 1;
        Self {
            store,
            applier: TxnApplier::new(),
            next_seq,
            term: 0,
            pending: BTreeMap::new(),
            gap_since: None,
            fenced,
        }
    }

    fn applied_index(&self) -> Seq {
        self.next_seq - 1
    }
}

/// Follower side of every shard hosted by this node
pub struct FollowerNode {
    /// Node ID
    node_id: String,
    config: ReplicationConfig,
    replicas: RwLock<HashMap<String, Arc<Mutex<Replica>>>>,
    sessions: DigestSessions,
    /// Transactions whose abort is being unwound, with the shard doing it
    aborting: std::sync::Mutex<HashMap<TxnId, String>>,
}

impl FollowerNode {
    /// Create a new follower node
    pub fn new(node_id: String, config: &ReplicationConfig, batch_ttl: Duration) -> Self {
        Self {
            node_id,
            config: config.clone(),
            replicas: RwLock::new(HashMap::new()),
            sessions: DigestSessions::new(batch_ttl),
            aborting: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Host a shard that is already part of the replication set
    pub async fn host(&self, shard: &str, store: Arc<dyn DocumentStore>) {
        let replica = Replica::new(store, None).await;
        tracing::info!(
            "{} following shard {} from seq {}",
            self.node_id,
            shard,
            replica.next_seq
        );
        self.replicas
            .write()
            .await
            .insert(shard.to_string(), Arc::new(Mutex::new(replica)));
    }

    async fn replica(&self, shard: &str) -> Result<Arc<Mutex<Replica>>> {
        self.replicas
            .read()
            .await
            .get(shard)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))
    }

    /// Replica of a shard, created fenced if the node does not host it yet
    async fn replica_or_fenced(&self, shard: &str) -> Arc<Mutex<Replica>> {
        if let Ok(replica) = self.replica(shard).await {
            return replica;
        }
        let created = Replica::new(Arc::new(MemoryStore::new()), Some(0)).await;
        let mut replicas = self.replicas.write().await;
        replicas
            .entry(shard.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(created)))
            .clone()
    }

    /// Local store of a shard
    pub async fn store(&self, shard: &str) -> Result<Arc<dyn DocumentStore>> {
        Ok(self.replica(shard).await?.lock().await.store.clone())
    }

    /// Last applied sequence of a shard
    pub async fn applied_index(&self, shard: &str) -> Result<Seq> {
        Ok(self.replica(shard).await?.lock().await.applied_index())
    }

    pub async fn is_fenced(&self, shard: &str) -> bool {
        match self.replica(shard).await {
            Ok(replica) => replica.lock().await.fenced.is_some(),
            Err(_) => false,
        }
    }

    /// Apply one replicated operation
    pub async fn apply(&self, entry: &OpEntry) -> Result<ApplyResponse> {
        let shard = entry.header.shard.as_str();
        if let Some(rejection) = self.foreign_abort(shard, entry) {
            return Ok(ApplyResponse::Rejected(rejection));
        }

        let replica = self.replica(shard).await?;
        let mut replica = replica.lock().await;

        if let Some(generation) = replica.fenced {
            return Ok(ApplyResponse::Rejected(Rejection::Fenced { generation }));
        }
        if entry.header.term < replica.term {
            return Ok(ApplyResponse::Rejected(Rejection::StaleTerm { term: replica.term }));
        }
        replica.term = entry.header.term;

        let seq = entry.seq();
        if seq < replica.next_seq {
            // Duplicate delivery
            return Ok(ApplyResponse::Ack {
                applied_index: replica.applied_index(),
            });
        }

        if seq > replica.next_seq {
            let expected = replica.next_seq;
            let overdue = replica
                .gap_since
                .is_some_and(|since| since.elapsed() > self.config.gap_timeout());
            if replica.pending.len() >= self.config.max_sequence_gap as usize || overdue {
                tracing::warn!(
                    "{} lagging on shard {}: expecting seq {}, {} buffered",
                    self.node_id,
                    shard,
                    expected,
                    replica.pending.len()
                );
                replica.pending.clear();
                replica.gap_since = None;
                return Ok(ApplyResponse::Rejected(Rejection::Lagging { expected }));
            }
            replica.pending.insert(seq, entry.clone());
            replica.gap_since.get_or_insert_with(Instant::now);
            return Ok(ApplyResponse::Rejected(Rejection::Gap { expected }));
        }

        let before = replica.applied_index();
        if let Some(rejection) = self.apply_in_order(shard, &mut replica, entry).await {
            return Ok(ApplyResponse::Rejected(rejection));
        }
        loop {
            let next_seq = replica.next_seq;
            let Some(next) = replica.pending.remove(&next_seq) else {
                break;
            };
            if let Some(rejection) = self.apply_in_order(shard, &mut replica, &next).await {
                return Ok(ApplyResponse::Rejected(rejection));
            }
        }
        if replica.pending.is_empty() {
            replica.gap_since = None;
        }
        if self.config.compaction_due(before, replica.applied_index()) {
            self.compact(shard, &replica).await;
        }

        Ok(ApplyResponse::Ack {
            applied_index: replica.applied_index(),
        })
    }

    async fn apply_in_order(&self, shard: &str, replica: &mut Replica, entry: &OpEntry) -> Option<Rejection> {
        let aborting = match (entry.op.txn, &entry.op.kind) {
            (Some(txn), OpKind::Abort) => {
                self.lock_aborting().insert(txn, shard.to_string());
                Some(txn)
            }
            _ => None,
        };

        let store = replica.store.clone();
        let result = replica.applier.apply(store.as_ref(), entry).await;

        if let Some(txn) = aborting {
            self.lock_aborting().remove(&txn);
        }

        match result {
            Ok(()) => {
                replica.next_seq = entry.seq() + 1;
                None
            }
            Err(Error::TransactionNotActive(txn)) => Some(Rejection::TransactionAborted {
                shard: shard.to_string(),
                txn,
            }),
            Err(e) => Some(Rejection::Incompatible {
                reason: e.to_string(),
            }),
        }
    }

    /// Drop versions below both the applied index and every open batch
    async fn compact(&self, shard: &str, replica: &Replica) {
        let applied = replica.applied_index();
        let horizon = self
            .sessions
            .oldest_tag(shard)
            .await
            .map_or(applied, |oldest| oldest.min(applied));
        match replica.store.compact(horizon).await {
            Ok(dropped) => tracing::debug!(
                "{} compacted shard {} below tag {}: {} versions dropped",
                self.node_id,
                shard,
                horizon,
                dropped
            ),
            Err(e) => tracing::warn!("{} failed to compact shard {}: {}", self.node_id, shard, e),
        }
    }

    /// Refuse operations of a transaction while another shard unwinds its abort
    fn foreign_abort(&self, shard: &str, entry: &OpEntry) -> Option<Rejection> {
        let txn = entry.op.txn?;
        let aborting = self.lock_aborting();
        match aborting.get(&txn) {
            Some(other) if other != shard => Some(Rejection::TransactionAborted {
                shard: other.clone(),
                txn,
            }),
            _ => None,
        }
    }

    fn lock_aborting(&self) -> std::sync::MutexGuard<'_, HashMap<TxnId, String>> {
        self.aborting.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop applying replicated operations of a shard
    pub async fn fence(&self, shard: &str, generation: u64) -> Result<()> {
        let replica = self.replica_or_fenced(shard).await;
        let mut replica = replica.lock().await;
        if replica.fenced.map_or(true, |g| g < generation) {
            replica.fenced = Some(generation);
        }
        replica.pending.clear();
        replica.gap_since = None;
        tracing::warn!(
            "{} fenced on shard {} at generation {}",
            self.node_id,
            shard,
            generation
        );
        Ok(())
    }

    /// Rejoin the replication set at the leader's position
    pub async fn readmit(&self, readmission: Readmission) -> Result<()> {
        let replica = self.replica_or_fenced(&readmission.shard).await;
        let mut replica = replica.lock().await;
        if let Some(fenced_at) = replica.fenced {
            if fenced_at >= readmission.generation {
                return Err(Error::StaleGeneration {
                    shard: readmission.shard.clone(),
                    expected: readmission.generation,
                    current: fenced_at,
                });
            }
        }

        replica.store.advance_tag(readmission.applied_index).await?;
        replica.applier.import_open(readmission.open_txns);
        replica.next_seq = readmission.applied_index + 1;
        replica.term = readmission.term;
        replica.pending.clear();
        replica.gap_since = None;
        replica.fenced = None;
        tracing::info!(
            "{} readmitted to shard {} at seq {} generation {}",
            self.node_id,
            readmission.shard,
            readmission.applied_index,
            readmission.generation
        );
        Ok(())
    }

    /// Pin the current snapshot of a shard for comparison
    pub async fn open_batch(&self, shard: &str) -> Result<BatchInfo> {
        let replica = self.replica_or_fenced(shard).await;
        // Registered before the replica unlocks, so compaction never passes the tag
        let replica = replica.lock().await;
        let tag = replica.store.current_tag().await;
        self.sessions.sweep().await;
        Ok(self.sessions.create(shard, tag).await)
    }

    pub async fn keepalive_batch(&self, batch_id: &str) -> Result<()> {
        self.sessions.keepalive(batch_id).await
    }

    pub async fn close_batch(&self, batch_id: &str) -> Result<()> {
        self.sessions.delete(batch_id).await;
        Ok(())
    }

    pub async fn digest_range(&self, batch_id: &str, range: KeyRange, parts: usize) -> Result<Vec<BucketDigest>> {
        let entries = self.scan_range(batch_id, range).await?;
        Ok(digest_range(range, &entries, parts.clamp(1, MAX_BUCKETS)))
    }

    pub async fn scan_range(&self, batch_id: &str, range: KeyRange) -> Result<Vec<DigestEntry>> {
        let (shard, tag) = self.sessions.get(batch_id).await?;
        let store = self.store(&shard).await?;
        store.scan(range, tag).await
    }

    /// Overwrite documents with the leader's; only while fenced
    pub async fn repair(&self, batch: RepairBatch) -> Result<Seq> {
        let replica = self.replica(&batch.shard).await?;
        let replica = replica.lock().await;
        if replica.fenced.is_none() {
            return Err(Error::State(format!(
                "refusing repair of shard {} outside resync",
                batch.shard
            )));
        }

        let tag = batch.tag.max(replica.store.current_tag().await);
        for doc in batch.upserts {
            replica.store.put(doc, tag).await?;
        }
        for key in &batch.removals {
            replica.store.remove(key, tag).await?;
        }
        replica.store.advance_tag(tag).await?;
        Ok(tag)
    }

    /// Remove every document of a shard; only while fenced
    pub async fn truncate(&self, shard: &str, tag: Seq) -> Result<u64> {
        let replica = self.replica_or_fenced(shard).await;
        let replica = replica.lock().await;
        if replica.fenced.is_none() {
            return Err(Error::State(format!(
                "refusing truncation of shard {} outside resync",
                shard
            )));
        }
        let tag = tag.max(replica.store.current_tag().await);
        let removed = replica.store.truncate(tag).await?;
        tracing::info!("{} truncated shard {}: {} documents", self.node_id, shard, removed);
        Ok(removed)
    }

    /// Serve one protocol request
    pub async fn handle(&self, message: Message) -> Message {
        let result = match message {
            Message::Apply { entry } => self
                .apply(&entry)
                .await
                .map(|response| Message::ApplyResult { response }),
            Message::Fence { shard, generation } => {
                self.fence(&shard, generation).await.map(|_| Message::Done)
            }
            Message::Readmit { readmission } => self.readmit(readmission).await.map(|_| Message::Done),
            Message::OpenDigestBatch { shard } => self
                .open_batch(&shard)
                .await
                .map(|batch| Message::DigestBatchOpened { batch }),
            Message::KeepaliveDigestBatch { batch_id } => {
                self.keepalive_batch(&batch_id).await.map(|_| Message::Done)
            }
            Message::CloseDigestBatch { batch_id } => {
                self.close_batch(&batch_id).await.map(|_| Message::Done)
            }
            Message::DigestRange {
                batch_id,
                range,
                parts,
            } => self
                .digest_range(&batch_id, range, parts as usize)
                .await
                .map(|buckets| Message::DigestRangeResult { buckets }),
            Message::ScanRange { batch_id, range } => self
                .scan_range(&batch_id, range)
                .await
                .map(|entries| Message::ScanRangeResult { entries }),
            Message::Repair { batch } => self.repair(batch).await.map(|tag| Message::Repaired { tag }),
            Message::Truncate { shard, tag } => self
                .truncate(&shard, tag)
                .await
                .map(|removed| Message::Truncated { removed }),
            other => {
                return Message::Error {
                    code: super::protocol::ErrorCode::BadRequest,
                    message: format!("unexpected {} request", other.type_name()),
                }
            }
        };

        result.unwrap_or_else(|e| Message::from_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Operation;
    use serde_json::json;

    fn node() -> FollowerNode {
        let config = ReplicationConfig {
            max_sequence_gap: 3,
            ..ReplicationConfig::default()
        };
        FollowerNode::new("F1".into(), &config, Duration::from_secs(60))
    }

    fn entry(seq: Seq, op: Operation) -> OpEntry {
        OpEntry::new("s1", seq, 1, op)
    }

    async fn hosted() -> FollowerNode {
        let node = node();
        node.host("s1", Arc::new(MemoryStore::new())).await;
        node
    }

    #[tokio::test]
    async fn test_in_order_apply() {
        let node = hosted().await;
        for seq in 1..=3 {
            let response = node
                .apply(&entry(seq, Operation::upsert(format!("k{}", seq), json!(seq))))
                .await
                .unwrap();
            assert_eq!(response, ApplyResponse::Ack { applied_index: seq });
        }
        // Duplicates are acknowledged without reapplying
        let response = node.apply(&entry(2, Operation::remove("k2"))).await.unwrap();
        assert_eq!(response, ApplyResponse::Ack { applied_index: 3 });
        assert!(node.store("s1").await.unwrap().get("k2", Seq::MAX).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gap_is_buffered_then_drained() {
        let node = hosted().await;
        let response = node.apply(&entry(2, Operation::upsert("b", json!(2)))).await.unwrap();
        assert_eq!(response, ApplyResponse::Rejected(Rejection::Gap { expected: 1 }));

        let response = node.apply(&entry(1, Operation::upsert("a", json!(1)))).await.unwrap();
        assert_eq!(response, ApplyResponse::Ack { applied_index: 2 });
    }

    #[tokio::test]
    async fn test_gap_overflow_reports_lagging() {
        let node = hosted().await;
        for seq in 2..=4 {
            node.apply(&entry(seq, Operation::upsert("x", json!(seq)))).await.unwrap();
        }
        let response = node.apply(&entry(5, Operation::upsert("x", json!(5)))).await.unwrap();
        assert_eq!(response, ApplyResponse::Rejected(Rejection::Lagging { expected: 1 }));
    }

    #[tokio::test]
    async fn test_fenced_replica_rejects_until_readmitted() {
        let node = hosted().await;
        node.apply(&entry(1, Operation::upsert("a", json!(1)))).await.unwrap();
        node.fence("s1", 2).await.unwrap();

        let response = node.apply(&entry(2, Operation::upsert("b", json!(2)))).await.unwrap();
        assert_eq!(response, ApplyResponse::Rejected(Rejection::Fenced { generation: 2 }));

        // A readmission from the fencing generation itself is stale
        let stale = Readmission {
            shard: "s1".into(),
            generation: 2,
            term: 1,
            applied_index: 5,
            open_txns: Vec::new(),
        };
        assert!(node.readmit(stale.clone()).await.is_err());

        node.readmit(Readmission { generation: 3, ..stale }).await.unwrap();
        let response = node.apply(&entry(6, Operation::upsert("c", json!(6)))).await.unwrap();
        assert_eq!(response, ApplyResponse::Ack { applied_index: 6 });
    }

    #[tokio::test]
    async fn test_operation_during_foreign_abort_names_the_aborting_shard() {
        let node = hosted().await;
        node.lock_aborting().insert(9, "other".into());

        let op = entry(1, Operation::upsert("a", json!(1)).in_txn(9));
        let response = node.apply(&op).await.unwrap();
        assert_eq!(
            response,
            ApplyResponse::Rejected(Rejection::TransactionAborted {
                shard: "other".into(),
                txn: 9
            })
        );

        node.lock_aborting().clear();
        assert!(matches!(node.apply(&op).await.unwrap(), ApplyResponse::Ack { .. }));
    }

    #[tokio::test]
    async fn test_repair_requires_fence() {
        let node = hosted().await;
        let mut batch = RepairBatch::new("s1", 4);
        batch.upserts.push(crate::store::Document {
            key: "a".into(),
            revision: 4,
            body: json!("leader"),
        });
        assert!(node.repair(batch.clone()).await.is_err());

        node.fence("s1", 1).await.unwrap();
        assert_eq!(node.repair(batch).await.unwrap(), 4);
        let doc = node.store("s1").await.unwrap().get("a", 4).await.unwrap().unwrap();
        assert_eq!(doc.body, json!("leader"));
    }

    #[tokio::test]
    async fn test_handle_digest_requests() {
        let node = hosted().await;
        for seq in 1..=20 {
            node.apply(&entry(seq, Operation::upsert(format!("k{}", seq), json!(seq))))
                .await
                .unwrap();
        }

        let batch = match node.handle(Message::OpenDigestBatch { shard: "s1".into() }).await {
            Message::DigestBatchOpened { batch } => batch,
            other => panic!("unexpected {}", other.type_name()),
        };
        assert_eq!(batch.tag, 20);

        let reply = node
            .handle(Message::DigestRange {
                batch_id: batch.id.clone(),
                range: KeyRange::FULL,
                parts: 16,
            })
            .await;
        match reply {
            Message::DigestRangeResult { buckets } => {
                assert_eq!(buckets.len(), 16);
                assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 20);
            }
            other => panic!("unexpected {}", other.type_name()),
        }

        node.handle(Message::CloseDigestBatch { batch_id: batch.id.clone() }).await;
        let reply = node
            .handle(Message::ScanRange {
                batch_id: batch.id,
                range: KeyRange::FULL,
            })
            .await;
        assert!(matches!(reply, Message::Error { .. }));
    }

    #[tokio::test]
    async fn test_oversized_digest_request_is_clamped() {
        let node = hosted().await;
        node.apply(&entry(1, Operation::upsert("a", json!(1)))).await.unwrap();
        let batch = node.open_batch("s1").await.unwrap();

        let buckets = node
            .digest_range(&batch.id, KeyRange::FULL, usize::MAX)
            .await
            .unwrap();
        assert_eq!(buckets.len(), MAX_BUCKETS);
        let buckets = node.digest_range(&batch.id, KeyRange::FULL, 0).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 1);
    }

    #[tokio::test]
    async fn test_open_batch_holds_back_compaction() {
        let config = ReplicationConfig {
            compaction_interval: 2,
            ..ReplicationConfig::default()
        };
        let node = FollowerNode::new("F1".into(), &config, Duration::from_secs(60));
        node.host("s1", Arc::new(MemoryStore::new())).await;
        node.apply(&entry(1, Operation::upsert("k", json!(1)))).await.unwrap();

        let batch = node.open_batch("s1").await.unwrap();
        for seq in 2..=4 {
            node.apply(&entry(seq, Operation::upsert("k", json!(seq)))).await.unwrap();
        }
        let pinned = node.scan_range(&batch.id, KeyRange::FULL).await.unwrap();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].revision, 1);

        node.close_batch(&batch.id).await.unwrap();
        for seq in 5..=6 {
            node.apply(&entry(seq, Operation::upsert("k", json!(seq)))).await.unwrap();
        }
        let store = node.store("s1").await.unwrap();
        assert!(store.get("k", 1).await.unwrap().is_none());
        assert_eq!(store.get("k", 6).await.unwrap().unwrap().revision, 6);
    }
}
