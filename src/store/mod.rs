//! Document Store Interface
//!
//! Narrow interface to the storage engine that owns a shard's documents,
//! plus the operation types that flow through replication.

mod memory;
mod txn;

pub use memory::MemoryStore;
pub use txn::{OpenTxn, TxnApplier, TxnStatus, UndoRecord};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::digest::KeyRange;
use crate::error::Result;

/// Per-shard operation sequence number. Doubles as the MVCC snapshot tag.
pub type Seq = u64;

/// Transaction identifier
pub type TxnId = u64;

/// Document revision
pub type Revision = u64;

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub revision: Revision,
    #[serde(with = "json_text")]
    pub body: serde_json::Value,
}

/// A (key, revision) pair as seen by the digest engine
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DigestEntry {
    /// Position of the key in the digest key space
    pub position: u64,
    pub key: String,
    pub revision: Revision,
}

/// What an operation does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Upsert {
        key: String,
        #[serde(with = "json_text")]
        body: serde_json::Value,
    },
    Remove { key: String },
    /// Flush the transaction's buffered writes, keeping undo information
    IntermediateCommit,
    Commit,
    Abort,
}

/// An operation submitted by the write path, optionally scoped to a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub txn: Option<TxnId>,
    pub kind: OpKind,
}

impl Operation {
    /// Upsert a document outside any transaction
    pub fn upsert(key: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            txn: None,
            kind: OpKind::Upsert { key: key.into(), body },
        }
    }

    /// Remove a document outside any transaction
    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            txn: None,
            kind: OpKind::Remove { key: key.into() },
        }
    }

    /// Commit marker for a transaction
    pub fn commit(txn: TxnId) -> Self {
        Self {
            txn: Some(txn),
            kind: OpKind::Commit,
        }
    }

    /// Abort marker for a transaction
    pub fn abort(txn: TxnId) -> Self {
        Self {
            txn: Some(txn),
            kind: OpKind::Abort,
        }
    }

    /// Intermediate commit marker for a transaction
    pub fn intermediate_commit(txn: TxnId) -> Self {
        Self {
            txn: Some(txn),
            kind: OpKind::IntermediateCommit,
        }
    }

    /// Scope this operation to a transaction
    pub fn in_txn(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Whether this operation is a transaction control marker
    pub fn is_marker(&self) -> bool {
        matches!(
            self.kind,
            OpKind::IntermediateCommit | OpKind::Commit | OpKind::Abort
        )
    }
}

/// Header carried by every replicated operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpHeader {
    pub shard: String,
    pub seq: Seq,
    pub term: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A sequenced operation as replicated to followers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpEntry {
    pub header: OpHeader,
    pub op: Operation,
}

impl OpEntry {
    /// Create an entry for the given shard position
    pub fn new(shard: &str, seq: Seq, term: u64, op: Operation) -> Self {
        Self {
            header: OpHeader {
                shard: shard.to_string(),
                seq,
                term,
                timestamp: chrono::Utc::now(),
            },
            op,
        }
    }

    pub fn seq(&self) -> Seq {
        self.header.seq
    }
}

/// Document bodies travel as JSON text; bincode cannot carry self-describing values
mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &serde_json::Value, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Position of a key in the 64-bit digest key space
pub fn key_position(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// Storage engine owning one shard's documents.
///
/// Every write is stamped with a snapshot tag; reads "as of" a tag see the
/// latest version written at or before it, so digest construction at a
/// pinned tag is unaffected by writes arriving afterwards.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Highest tag made visible so far
    async fn current_tag(&self) -> Seq;

    /// Make `tag` visible without writing (control markers)
    async fn advance_tag(&self, tag: Seq) -> Result<()>;

    /// Read a document as of `tag`
    async fn get(&self, key: &str, tag: Seq) -> Result<Option<Document>>;

    /// Write a document version at `tag`
    async fn put(&self, doc: Document, tag: Seq) -> Result<()>;

    /// Write a tombstone at `tag`
    async fn remove(&self, key: &str, tag: Seq) -> Result<()>;

    /// (key, revision) pairs in `range` as of `tag`, ordered by position then key
    async fn scan(&self, range: KeyRange, tag: Seq) -> Result<Vec<DigestEntry>>;

    /// Number of live documents as of `tag`
    async fn count(&self, tag: Seq) -> Result<u64>;

    /// Tombstone every live document at `tag`, returning how many were removed
    async fn truncate(&self, tag: Seq) -> Result<u64>;

    /// Drop versions no read at or after `horizon` can see, returning how many went.
    /// Reads below the horizon are undefined afterwards.
    async fn compact(&self, horizon: Seq) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_position_is_stable() {
        assert_eq!(key_position("users/1"), key_position("users/1"));
        assert_ne!(key_position("users/1"), key_position("users/2"));
    }

    #[test]
    fn test_operation_builders() {
        let op = Operation::upsert("k", serde_json::json!({"a": 1})).in_txn(7);
        assert_eq!(op.txn, Some(7));
        assert!(!op.is_marker());
        assert!(Operation::commit(7).is_marker());
    }

    #[test]
    fn test_entry_survives_bincode() {
        let entry = OpEntry::new("s1", 3, 1, Operation::upsert("k", serde_json::json!({"a": [1, 2]})));
        let bytes = bincode::serialize(&entry).unwrap();
        let restored: OpEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, entry);
    }
}
