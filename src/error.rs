//! WolfShard Error Types

use thiserror::Error;

use crate::store::{Seq, TxnId};

/// Result type alias for WolfShard operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfShard error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Registry errors
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Participant {participant} is not part of shard {shard}")]
    ParticipantNotFound { shard: String, participant: String },

    #[error("Not leader of shard {shard}: current leader is {leader}")]
    NotLeader { shard: String, leader: String },

    #[error("Stale generation for shard {shard}: expected {expected}, current {current}")]
    StaleGeneration {
        shard: String,
        expected: u64,
        current: u64,
    },

    #[error("Leader establishment already in flight for shard {0}")]
    EstablishmentInProgress(String),

    // Replication errors
    #[error("Timed out replicating seq {seq} of shard {shard} to {follower}")]
    Timeout {
        shard: String,
        follower: String,
        seq: Seq,
    },

    #[error("Follower {follower} hard-rejected shard {shard}: {reason}")]
    HardRejection {
        shard: String,
        follower: String,
        reason: String,
    },

    #[error("Follower {follower} lags shard {shard}, expecting seq {expected}")]
    Lagging {
        shard: String,
        follower: String,
        expected: Seq,
    },

    #[error("Follower {follower} rejected an operation of shard {shard}: {reason}")]
    Rejected {
        shard: String,
        follower: String,
        reason: String,
    },

    #[error("Abort of transaction {txn} on shard {shard} observed by an unrelated operation")]
    CrossShardAbortRace { shard: String, txn: TxnId },

    #[error("Follower is fenced for shard {shard} at generation {generation}")]
    Fenced { shard: String, generation: u64 },

    #[error("Transaction {0} is not active")]
    TransactionNotActive(TxnId),

    // Digest errors
    #[error("Digest tree corrupted for shard {shard}: {reason}")]
    TreeCorruption { shard: String, reason: String },

    #[error("Digest tree for shard {shard} rebuilt {rebuilds} times within {window_secs}s")]
    RebuildStorm {
        shard: String,
        rebuilds: usize,
        window_secs: u64,
    },

    #[error("Digest batch not found or expired: {0}")]
    BatchNotFound(String),

    // Reconciliation errors
    #[error("Resync of {follower} for shard {shard} exceeded its TTL")]
    ResyncTimeout { shard: String, follower: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::ResyncTimeout { .. }
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error must never count against a follower
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::CrossShardAbortRace { .. })
    }

    /// Check if this error drops the follower immediately, without retry
    pub fn forces_drop(&self) -> bool {
        matches!(self, Error::HardRejection { .. })
    }
}
