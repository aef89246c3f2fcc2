//! Digest Tree Module
//!
//! Anti-entropy support: range-partitioned checksum trees over a pinned
//! snapshot, divergence location, and comparison sessions.

mod engine;
mod locate;
mod session;
mod tree;

pub use engine::{DigestEngine, RebuildReason};
pub use locate::{DigestSource, DivergenceLocator, Located, StoreDigestSource};
pub use session::{BatchInfo, DigestSessions};
pub use tree::{
    bucket_count, compare, compare_buckets, digest_range, entry_hash, BucketDigest, DigestTree,
    KeyRange, MAX_BUCKETS, MIN_BUCKETS, TARGET_ROWS_PER_BUCKET,
};
