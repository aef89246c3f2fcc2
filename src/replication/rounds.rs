//! Per-shard replication logs
//!
//! Each shard the node leads has one [`ShardLog`] behind its own mutex, the
//! round lock. Holding it means no operation of that shard is in flight;
//! shards never wait on each other. Snapshots read outside the round lock
//! are pinned so compaction keeps them readable.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::store::{DocumentStore, OpEntry, Seq, TxnApplier};

type Pins = Arc<std::sync::Mutex<BTreeMap<Seq, usize>>>;

fn lock_pins(pins: &Pins) -> std::sync::MutexGuard<'_, BTreeMap<Seq, usize>> {
    pins.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps one snapshot of a shard readable until dropped
pub struct SnapshotPin {
    tag: Seq,
    pins: Pins,
}

impl SnapshotPin {
    pub fn tag(&self) -> Seq {
        self.tag
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let mut pins = lock_pins(&self.pins);
        if let Some(count) = pins.get_mut(&self.tag) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.tag);
            }
        }
    }
}

/// Leader-side state of one shard
pub struct ShardLog {
    shard: String,
    store: Arc<dyn DocumentStore>,
    applier: TxnApplier,
    last_seq: Seq,
    backlog: VecDeque<Arc<OpEntry>>,
    backlog_capacity: usize,
    pins: Pins,
}

impl ShardLog {
    fn new(shard: &str, store: Arc<dyn DocumentStore>, last_seq: Seq, backlog_capacity: usize) -> Self {
        Self {
            shard: shard.to_string(),
            store,
            applier: TxnApplier::new(),
            last_seq,
            backlog: VecDeque::with_capacity(backlog_capacity),
            backlog_capacity,
            pins: Pins::default(),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    pub fn applier(&self) -> &TxnApplier {
        &self.applier
    }

    /// Last sequence number assigned
    pub fn last_seq(&self) -> Seq {
        self.last_seq
    }

    /// Assign the next sequence number and apply the entry locally
    pub(crate) async fn append(&mut self, entry: OpEntry) -> Result<Arc<OpEntry>> {
        if entry.seq() != self.last_seq + 1 {
            return Err(Error::Internal(format!(
                "shard {} expected seq {}, got {}",
                self.shard,
                self.last_seq + 1,
                entry.seq()
            )));
        }
        self.applier.apply(self.store.as_ref(), &entry).await?;
        self.last_seq = entry.seq();

        let entry = Arc::new(entry);
        self.backlog.push_back(entry.clone());
        while self.backlog.len() > self.backlog_capacity {
            self.backlog.pop_front();
        }
        Ok(entry)
    }

    /// Pin the snapshot at the last assigned seq
    pub fn pin(&self) -> SnapshotPin {
        *lock_pins(&self.pins).entry(self.last_seq).or_insert(0) += 1;
        SnapshotPin {
            tag: self.last_seq,
            pins: self.pins.clone(),
        }
    }

    /// Oldest snapshot that must stay readable
    pub fn horizon(&self) -> Seq {
        lock_pins(&self.pins)
            .keys()
            .next()
            .copied()
            .map_or(self.last_seq, |oldest| oldest.min(self.last_seq))
    }

    /// Drop store versions below the horizon
    pub(crate) async fn compact(&self) -> Result<usize> {
        let horizon = self.horizon();
        let dropped = self.store.compact(horizon).await?;
        tracing::debug!(
            "Compacted shard {} below tag {}: {} versions dropped",
            self.shard,
            horizon,
            dropped
        );
        Ok(dropped)
    }

    /// Backlog entries from `from` up to and including `to`, if all are retained
    pub fn backlog_range(&self, from: Seq, to: Seq) -> Option<Vec<Arc<OpEntry>>> {
        let first = self.backlog.front()?.seq();
        if from < first || to > self.last_seq || from > to {
            return None;
        }
        Some(
            self.backlog
                .iter()
                .filter(|e| (from..=to).contains(&e.seq()))
                .cloned()
                .collect(),
        )
    }
}

/// Round locks of every led shard
#[derive(Default)]
pub struct ShardRounds {
    logs: RwLock<HashMap<String, Arc<Mutex<ShardLog>>>>,
}

impl ShardRounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start leading a shard backed by `store`
    pub async fn open(&self, shard: &str, store: Arc<dyn DocumentStore>, backlog_capacity: usize) {
        let last_seq = store.current_tag().await;
        let mut logs = self.logs.write().await;
        logs.entry(shard.to_string()).or_insert_with(|| {
            tracing::info!("Leading shard {} from seq {}", shard, last_seq);
            Arc::new(Mutex::new(ShardLog::new(shard, store, last_seq, backlog_capacity)))
        });
    }

    /// Stop leading a shard
    pub async fn close(&self, shard: &str) -> bool {
        self.logs.write().await.remove(shard).is_some()
    }

    /// Acquire the round lock of a shard
    pub async fn lock(&self, shard: &str) -> Result<OwnedMutexGuard<ShardLog>> {
        let log = {
            let logs = self.logs.read().await;
            logs.get(shard)
                .cloned()
                .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?
        };
        Ok(log.lock_owned().await)
    }

    /// Leader store of a shard
    pub async fn store(&self, shard: &str) -> Result<Arc<dyn DocumentStore>> {
        Ok(self.lock(shard).await?.store())
    }

    pub async fn shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.logs.read().await.keys().cloned().collect();
        shards.sort();
        shards
    }
}
