//! Digest Tree
//!
//! A digest tree partitions the 64-bit key position space into ordered,
//! disjoint, exhaustive buckets. Each bucket carries the number of
//! (key, revision) entries it holds and the XOR of their entry hashes, so
//! adjacent buckets aggregate exactly and two trees with different bucket
//! counts can still be compared on their common boundaries.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{DigestEntry, Revision, Seq};

/// Rows a bucket should hold on average
pub const TARGET_ROWS_PER_BUCKET: u64 = 128;
/// Smallest bucket count of a tree
pub const MIN_BUCKETS: usize = 16;
/// Largest bucket count of a tree
pub const MAX_BUCKETS: usize = 65_536;

/// Bucket count for a shard holding `rows` entries.
///
/// Rounded up to a power of two so trees of similar size share boundaries.
pub fn bucket_count(rows: u64) -> usize {
    let wanted = rows.div_ceil(TARGET_ROWS_PER_BUCKET).max(1);
    let buckets = usize::try_from(wanted.next_power_of_two()).unwrap_or(MAX_BUCKETS);
    buckets.clamp(MIN_BUCKETS, MAX_BUCKETS)
}

/// Hash of a single (key, revision) pair
pub fn entry_hash(key: &str, revision: Revision) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[0]);
    hasher.update(&revision.to_le_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Inclusive range of key positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    /// The whole key space
    pub const FULL: KeyRange = KeyRange {
        start: 0,
        end: u64::MAX,
    };

    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }

    /// Number of positions covered
    pub fn width(&self) -> u128 {
        u128::from(self.end - self.start) + 1
    }

    /// Split into at most `parts` consecutive sub-ranges covering this range exactly
    pub fn split(&self, parts: usize) -> Vec<KeyRange> {
        let width = self.width();
        let parts = (parts.max(1) as u128).min(width);
        let step = width / parts;
        let remainder = width % parts;

        let mut ranges = Vec::with_capacity(parts as usize);
        let mut cursor = u128::from(self.start);
        for i in 0..parts {
            let len = step + u128::from(i < remainder);
            let end = cursor + len - 1;
            ranges.push(KeyRange::new(cursor as u64, end as u64));
            cursor = end + 1;
        }
        ranges
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:016x}, {:016x}]", self.start, self.end)
    }
}

/// One bucket record, as transmitted on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDigest {
    pub range_start: u64,
    pub range_end: u64,
    pub count: u64,
    pub checksum: u64,
}

impl BucketDigest {
    /// An empty bucket over `range`
    pub fn empty(range: KeyRange) -> Self {
        Self {
            range_start: range.start,
            range_end: range.end,
            count: 0,
            checksum: 0,
        }
    }

    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.range_start, self.range_end)
    }

    /// Whether two buckets carry the same contents
    pub fn matches(&self, other: &BucketDigest) -> bool {
        self.count == other.count && self.checksum == other.checksum
    }

    fn absorb(&mut self, entry: &DigestEntry) {
        self.count += 1;
        self.checksum ^= entry_hash(&entry.key, entry.revision);
    }

    /// Extend this bucket with the adjacent bucket that follows it
    fn merge(&mut self, next: &BucketDigest) {
        self.range_end = next.range_end;
        self.count += next.count;
        self.checksum ^= next.checksum;
    }
}

/// Digest `range` split into `parts` buckets from entries sorted by position
pub fn digest_range(range: KeyRange, entries: &[DigestEntry], parts: usize) -> Vec<BucketDigest> {
    let mut buckets: Vec<BucketDigest> = range.split(parts).into_iter().map(BucketDigest::empty).collect();
    let mut index = 0;
    for entry in entries.iter().filter(|e| range.contains(e.position)) {
        while entry.position > buckets[index].range_end {
            index += 1;
        }
        buckets[index].absorb(entry);
    }
    buckets
}

/// Range-partitioned checksum tree over one shard at one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestTree {
    shard: String,
    snapshot_tag: Seq,
    root: BucketDigest,
    buckets: Vec<BucketDigest>,
}

impl DigestTree {
    /// Build a tree over the full key space from entries sorted by position
    pub fn build(shard: &str, snapshot_tag: Seq, entries: &[DigestEntry], buckets: usize) -> Self {
        let buckets = digest_range(KeyRange::FULL, entries, buckets);
        let mut root = BucketDigest::empty(KeyRange::FULL);
        for bucket in &buckets {
            root.count += bucket.count;
            root.checksum ^= bucket.checksum;
        }

        Self {
            shard: shard.to_string(),
            snapshot_tag,
            root,
            buckets,
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn snapshot_tag(&self) -> Seq {
        self.snapshot_tag
    }

    pub fn root(&self) -> &BucketDigest {
        &self.root
    }

    pub fn count(&self) -> u64 {
        self.root.count
    }

    pub fn buckets(&self) -> &[BucketDigest] {
        &self.buckets
    }

    #[cfg(test)]
    pub(crate) fn buckets_mut(&mut self) -> &mut Vec<BucketDigest> {
        &mut self.buckets
    }

    /// Check that the buckets partition the key space and fold into the root
    pub fn verify_structure(&self) -> Result<()> {
        let corrupt = |reason: String| Error::TreeCorruption {
            shard: self.shard.clone(),
            reason,
        };

        let mut expected_start = Some(self.root.range_start);
        let mut count = 0u64;
        let mut checksum = 0u64;
        for bucket in &self.buckets {
            if Some(bucket.range_start) != expected_start || bucket.range_end < bucket.range_start {
                return Err(corrupt(format!("bucket {} breaks the partition", bucket.range())));
            }
            expected_start = bucket.range_end.checked_add(1);
            count += bucket.count;
            checksum ^= bucket.checksum;
        }

        if self.buckets.last().map(|b| b.range_end) != Some(self.root.range_end) {
            return Err(corrupt("buckets do not cover the key space".into()));
        }
        if count != self.root.count || checksum != self.root.checksum {
            return Err(corrupt(format!(
                "root aggregate {}/{:016x} differs from buckets {}/{:016x}",
                self.root.count, self.root.checksum, count, checksum
            )));
        }
        Ok(())
    }
}

/// Ranges where two trees disagree. Matching buckets are skipped without inspection.
pub fn compare(a: &DigestTree, b: &DigestTree) -> Vec<KeyRange> {
    if a.root.matches(&b.root) && a.buckets == b.buckets {
        return Vec::new();
    }
    compare_buckets(a.buckets.iter().copied(), b.buckets.iter().copied())
}

/// Streaming comparison of two ordered bucket sequences over the same range.
///
/// Buckets are aggregated on either side until both reach a common boundary,
/// so sequences with different bucket counts compare on their coarsest
/// shared partition.
pub fn compare_buckets<A, B>(a: A, b: B) -> Vec<KeyRange>
where
    A: IntoIterator<Item = BucketDigest>,
    B: IntoIterator<Item = BucketDigest>,
{
    let mut left = a.into_iter();
    let mut right = b.into_iter();
    let mut divergent = Vec::new();

    loop {
        let (mut acc_a, mut acc_b) = match (left.next(), right.next()) {
            (Some(x), Some(y)) => (x, y),
            (Some(x), None) | (None, Some(x)) => {
                // Coverage mismatch: anything left over is unaccounted for
                let mut rest = x;
                for bucket in left.by_ref().chain(right.by_ref()) {
                    rest.merge(&bucket);
                }
                if rest.count > 0 {
                    divergent.push(rest.range());
                }
                break;
            }
            (None, None) => break,
        };

        let mut exhausted = false;
        while acc_a.range_end != acc_b.range_end {
            let next = if acc_a.range_end < acc_b.range_end {
                left.next().map(|n| acc_a.merge(&n))
            } else {
                right.next().map(|n| acc_b.merge(&n))
            };
            if next.is_none() {
                exhausted = true;
                break;
            }
        }

        if exhausted || acc_a.range_start != acc_b.range_start || !acc_a.matches(&acc_b) {
            divergent.push(KeyRange::new(
                acc_a.range_start.min(acc_b.range_start),
                acc_a.range_end.max(acc_b.range_end),
            ));
        }
        if exhausted {
            break;
        }
    }

    divergent
}
