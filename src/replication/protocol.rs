//! Replication Protocol
//!
//! Defines the wire protocol between a shard leader and its followers.

use serde::{Deserialize, Serialize};

use crate::digest::{BatchInfo, BucketDigest, KeyRange};
use crate::store::{DigestEntry, Document, OpEntry, OpenTxn, Seq, TxnId};

/// Why a follower refused an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// Sequence is ahead of the next expected one; the follower buffered it
    Gap { expected: Seq },
    /// The gap buffer overflowed or timed out
    Lagging { expected: Seq },
    /// The follower state cannot accept the operation
    Incompatible { reason: String },
    /// Unrecoverable refusal; drop without retry
    Hard { reason: String },
    /// The follower is excluded from the shard until re-admitted
    Fenced { generation: u64 },
    /// The operation carries an older term than the follower has seen
    StaleTerm { term: u64 },
    /// A transaction was aborted while the operation was in flight
    TransactionAborted { shard: String, txn: TxnId },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Gap { expected } => write!(f, "gap, expecting seq {}", expected),
            Rejection::Lagging { expected } => write!(f, "lagging, expecting seq {}", expected),
            Rejection::Incompatible { reason } => write!(f, "incompatible: {}", reason),
            Rejection::Hard { reason } => write!(f, "hard rejection: {}", reason),
            Rejection::Fenced { generation } => write!(f, "fenced at generation {}", generation),
            Rejection::StaleTerm { term } => write!(f, "stale term, follower is at term {}", term),
            Rejection::TransactionAborted { shard, txn } => {
                write!(f, "transaction {} aborted on shard {}", txn, shard)
            }
        }
    }
}

/// Follower answer to a replicated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResponse {
    /// Applied durably up to and including `applied_index`
    Ack { applied_index: Seq },
    Rejected(Rejection),
}

/// State handed to a follower when it rejoins the replication set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readmission {
    pub shard: String,
    pub generation: u64,
    pub term: u64,
    /// Last sequence the leader assigned
    pub applied_index: Seq,
    /// Transactions still open on the leader
    pub open_txns: Vec<OpenTxn>,
}

/// Documents pushed from the leader during repair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairBatch {
    pub shard: String,
    /// Leader snapshot the documents were read at
    pub tag: Seq,
    pub upserts: Vec<Document>,
    pub removals: Vec<String>,
}

impl RepairBatch {
    pub fn new(shard: &str, tag: Seq) -> Self {
        Self {
            shard: shard.to_string(),
            tag,
            upserts: Vec::new(),
            removals: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Replication ==========
    /// Apply one sequenced operation
    Apply { entry: OpEntry },

    /// Answer to `Apply`
    ApplyResult { response: ApplyResponse },

    /// Stop accepting replicated operations for a shard
    Fence { shard: String, generation: u64 },

    /// Rejoin the replication set
    Readmit { readmission: Readmission },

    // ========== Digest comparison ==========
    /// Pin a snapshot of a shard for comparison
    OpenDigestBatch { shard: String },

    /// Answer to `OpenDigestBatch`
    DigestBatchOpened { batch: BatchInfo },

    /// Extend the lifetime of a batch
    KeepaliveDigestBatch { batch_id: String },

    /// Release a batch
    CloseDigestBatch { batch_id: String },

    /// Digest a key range of a batch snapshot
    DigestRange {
        batch_id: String,
        range: KeyRange,
        parts: u32,
    },

    /// Answer to `DigestRange`, ordered by `range_start`
    DigestRangeResult { buckets: Vec<BucketDigest> },

    /// List (key, revision) pairs of a key range of a batch snapshot
    ScanRange { batch_id: String, range: KeyRange },

    /// Answer to `ScanRange`
    ScanRangeResult { entries: Vec<DigestEntry> },

    // ========== Repair ==========
    /// Overwrite follower documents with the leader's
    Repair { batch: RepairBatch },

    /// Answer to `Repair` with the follower's tag afterwards
    Repaired { tag: Seq },

    /// Remove every document of a shard
    Truncate { shard: String, tag: Seq },

    /// Answer to `Truncate`
    Truncated { removed: u64 },

    // ========== Generic ==========
    /// Request succeeded without a payload
    Done,

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Batch expired or unknown
    BatchNotFound,
    /// Shard unknown on this node
    ShardNotFound,
    /// Follower is fenced
    Fenced,
    /// Storage failure
    Storage,
    /// Unexpected message
    BadRequest,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Build an error response from a local error
    pub fn from_error(error: &crate::Error) -> Self {
        let code = match error {
            crate::Error::BatchNotFound(_) => ErrorCode::BatchNotFound,
            crate::Error::ShardNotFound(_) => ErrorCode::ShardNotFound,
            crate::Error::Fenced { .. } => ErrorCode::Fenced,
            crate::Error::Storage(_) => ErrorCode::Storage,
            _ => ErrorCode::Internal,
        };
        Message::Error {
            code,
            message: error.to_string(),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Apply { .. } => "Apply",
            Message::ApplyResult { .. } => "ApplyResult",
            Message::Fence { .. } => "Fence",
            Message::Readmit { .. } => "Readmit",
            Message::OpenDigestBatch { .. } => "OpenDigestBatch",
            Message::DigestBatchOpened { .. } => "DigestBatchOpened",
            Message::KeepaliveDigestBatch { .. } => "KeepaliveDigestBatch",
            Message::CloseDigestBatch { .. } => "CloseDigestBatch",
            Message::DigestRange { .. } => "DigestRange",
            Message::DigestRangeResult { .. } => "DigestRangeResult",
            Message::ScanRange { .. } => "ScanRange",
            Message::ScanRangeResult { .. } => "ScanRangeResult",
            Message::Repair { .. } => "Repair",
            Message::Repaired { .. } => "Repaired",
            Message::Truncate { .. } => "Truncate",
            Message::Truncated { .. } => "Truncated",
            Message::Done => "Done",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Operation;

    #[test]
    fn test_apply_message_serialization() {
        let entry = OpEntry::new("s1", 7, 2, Operation::upsert("k", serde_json::json!({"n": 1})));
        let msg = Message::Apply {
            entry: entry.clone(),
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Apply { entry: restored } => assert_eq!(restored, entry),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_digest_range_result_keeps_bucket_order() {
        let buckets = KeyRange::FULL
            .split(4)
            .into_iter()
            .enumerate()
            .map(|(i, r)| BucketDigest {
                range_start: r.start,
                range_end: r.end,
                count: i as u64,
                checksum: i as u64 * 31,
            })
            .collect::<Vec<_>>();
        let msg = Message::DigestRangeResult {
            buckets: buckets.clone(),
        };
        match Message::deserialize(&msg.serialize().unwrap()).unwrap() {
            Message::DigestRangeResult { buckets: restored } => assert_eq!(restored, buckets),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
