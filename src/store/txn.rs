//! Transaction Applier
//!
//! Applies sequenced operations to a [`DocumentStore`] with all-or-nothing
//! transaction semantics. Writes inside a transaction are buffered until an
//! intermediate commit or the final commit flushes them; flushed writes keep
//! undo records so a later abort still unwinds everything since the first
//! real operation of the transaction. Leader and followers run the same
//! applier, so equal operation streams produce equal store states.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{Document, DocumentStore, OpEntry, OpKind, Seq, TxnId};
use crate::error::{Error, Result};

/// Number of finished transaction outcomes remembered
const FINISHED_CAPACITY: usize = 4096;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

/// State needed to restore one key if its transaction aborts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub key: String,
    pub previous: Option<Document>,
}

/// An active transaction, exportable so a re-admitted follower can resume it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTxn {
    pub txn: TxnId,
    /// Buffered writes with the sequence number that produced them
    pub buffered: Vec<(Seq, OpKind)>,
    pub undo: Vec<UndoRecord>,
    pub intermediate_commits: u32,
}

impl OpenTxn {
    fn new(txn: TxnId) -> Self {
        Self {
            txn,
            buffered: Vec::new(),
            undo: Vec::new(),
            intermediate_commits: 0,
        }
    }
}

/// Applies operation entries to a store
#[derive(Debug, Default)]
pub struct TxnApplier {
    open: HashMap<TxnId, OpenTxn>,
    finished: HashMap<TxnId, TxnStatus>,
    finished_order: VecDeque<TxnId>,
}

impl TxnApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a transaction, if known
    pub fn status(&self, txn: TxnId) -> Option<TxnStatus> {
        if self.open.contains_key(&txn) {
            Some(TxnStatus::Active)
        } else {
            self.finished.get(&txn).copied()
        }
    }

    /// Writes buffered since the transaction's last flush
    pub fn buffered_len(&self, txn: TxnId) -> usize {
        self.open.get(&txn).map(|t| t.buffered.len()).unwrap_or(0)
    }

    /// Intermediate commits performed by an active transaction
    pub fn intermediate_commits(&self, txn: TxnId) -> u32 {
        self.open
            .get(&txn)
            .map(|t| t.intermediate_commits)
            .unwrap_or(0)
    }

    /// Snapshot of all active transactions
    pub fn export_open(&self) -> Vec<OpenTxn> {
        let mut open: Vec<OpenTxn> = self.open.values().cloned().collect();
        open.sort_by_key(|t| t.txn);
        open
    }

    /// Replace all transaction state with an exported snapshot
    pub fn import_open(&mut self, open: Vec<OpenTxn>) {
        self.open = open.into_iter().map(|t| (t.txn, t)).collect();
        self.finished.clear();
        self.finished_order.clear();
    }

    /// Drop all transaction state
    pub fn reset(&mut self) {
        self.open.clear();
        self.finished.clear();
        self.finished_order.clear();
    }

    /// Check that an operation can be applied without touching the store
    pub fn check(&self, entry: &OpEntry) -> Result<()> {
        match entry.op.txn {
            None if entry.op.is_marker() => Err(Error::Storage(format!(
                "control marker at seq {} has no transaction",
                entry.seq()
            ))),
            // A marker for a transaction that never buffered anything is fine
            Some(txn) if self.finished.contains_key(&txn) => {
                Err(Error::TransactionNotActive(txn))
            }
            _ => Ok(()),
        }
    }

    /// Apply one sequenced operation
    pub async fn apply(&mut self, store: &dyn DocumentStore, entry: &OpEntry) -> Result<()> {
        self.check(entry)?;
        let seq = entry.seq();

        match (entry.op.txn, &entry.op.kind) {
            (None, kind) => {
                write(store, kind, seq).await?;
            }
            (Some(txn), OpKind::Upsert { .. }) | (Some(txn), OpKind::Remove { .. }) => {
                self.open
                    .entry(txn)
                    .or_insert_with(|| OpenTxn::new(txn))
                    .buffered
                    .push((seq, entry.op.kind.clone()));
            }
            (Some(txn), OpKind::IntermediateCommit) => {
                if let Some(state) = self.open.get_mut(&txn) {
                    flush(store, state, seq).await?;
                    state.intermediate_commits += 1;
                    tracing::debug!(
                        "Intermediate commit {} of txn {} at seq {}",
                        state.intermediate_commits,
                        txn,
                        seq
                    );
                }
            }
            (Some(txn), OpKind::Commit) => {
                if let Some(mut state) = self.open.remove(&txn) {
                    flush(store, &mut state, seq).await?;
                }
                self.finish(txn, TxnStatus::Committed);
            }
            (Some(txn), OpKind::Abort) => {
                if let Some(state) = self.open.remove(&txn) {
                    for record in state.undo.into_iter().rev() {
                        match record.previous {
                            Some(doc) => store.put(doc, seq).await?,
                            None => store.remove(&record.key, seq).await?,
                        }
                    }
                }
                self.finish(txn, TxnStatus::Aborted);
            }
        }

        store.advance_tag(seq).await
    }

    fn finish(&mut self, txn: TxnId, status: TxnStatus) {
        self.finished.insert(txn, status);
        self.finished_order.push_back(txn);
        while self.finished_order.len() > FINISHED_CAPACITY {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}

/// Apply a single write outside any transaction
async fn write(store: &dyn DocumentStore, kind: &OpKind, seq: Seq) -> Result<()> {
    write_with_revision(store, kind, seq, seq).await
}

async fn write_with_revision(
    store: &dyn DocumentStore,
    kind: &OpKind,
    revision: Seq,
    tag: Seq,
) -> Result<()> {
    match kind {
        OpKind::Upsert { key, body } => {
            store
                .put(
                    Document {
                        key: key.clone(),
                        revision,
                        body: body.clone(),
                    },
                    tag,
                )
                .await
        }
        OpKind::Remove { key } => store.remove(key, tag).await,
        _ => Ok(()),
    }
}

/// Move buffered writes into the store at `tag`, recording undo state
async fn flush(store: &dyn DocumentStore, state: &mut OpenTxn, tag: Seq) -> Result<()> {
    for (seq, kind) in std::mem::take(&mut state.buffered) {
        let key = match &kind {
            OpKind::Upsert { key, .. } | OpKind::Remove { key } => key.clone(),
            _ => continue,
        };
        let previous = store.get(&key, Seq::MAX).await?;
        state.undo.push(UndoRecord { key, previous });
        write_with_revision(store, &kind, seq, tag).await?;
    }
    Ok(())
}
