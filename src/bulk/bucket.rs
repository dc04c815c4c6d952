//! Bucket types and data structures
//!
//! A bucket is the unit of work published on the partitioned log: an ordered
//! slice of record ids for one command.
//!
//! Buckets are assigned to partitions round-robin in scroll order. Bucket `i`
//! of a command lands on partition `i % partitions` with sequence
//! `i / partitions`, so re-scrolling an unchanged dataset reproduces the same
//! `(command, partition, sequence)` dedup keys.

use serde::{Deserialize, Serialize};

/// A bucket of record ids to process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkBucket {
    /// Command this bucket belongs to
    pub command_id: String,
    /// Partition key (partition index on the bucket topic)
    pub partition: u32,
    /// Sequence within the partition, for dedup on redelivery
    pub sequence: u64,
    /// Record ids, in scroll order
    pub ids: Vec<String>,
}

impl BulkBucket {
    /// Number of record ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Round-robin placement of the `index`-th bucket of a command
pub fn assign_partition(index: u64, partitions: u32) -> (u32, u64) {
    let partitions = u64::from(partitions.max(1));
    ((index % partitions) as u32, index / partitions)
}

/// Builder that cuts a stream of ids into buckets with size limits
pub struct BucketBuilder {
    command_id: String,
    partitions: u32,
    bucket_size: usize,
    current: Vec<String>,
    buckets_built: u64,
}

impl BucketBuilder {
    /// Create a new bucket builder
    pub fn new(command_id: &str, bucket_size: usize, partitions: u32) -> Self {
        let bucket_size = bucket_size.max(1);
        Self {
            command_id: command_id.to_string(),
            partitions: partitions.max(1),
            bucket_size,
            current: Vec::with_capacity(bucket_size),
            buckets_built: 0,
        }
    }

    /// Add an id, returns a full bucket when the limit is reached
    pub fn push(&mut self, id: String) -> Option<BulkBucket> {
        self.current.push(id);
        if self.is_full() {
            self.take()
        } else {
            None
        }
    }

    /// Check if the current bucket is full
    pub fn is_full(&self) -> bool {
        self.current.len() >= self.bucket_size
    }

    /// Check if the current bucket is empty
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Get current id count
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Number of buckets built so far
    pub fn buckets_built(&self) -> u64 {
        self.buckets_built
    }

    /// Take the current bucket and start a new one
    pub fn take(&mut self) -> Option<BulkBucket> {
        if self.current.is_empty() {
            return None;
        }
        let ids = std::mem::replace(&mut self.current, Vec::with_capacity(self.bucket_size));
        let (partition, sequence) = assign_partition(self.buckets_built, self.partitions);
        self.buckets_built += 1;
        Some(BulkBucket {
            command_id: self.command_id.clone(),
            partition,
            sequence,
            ids,
        })
    }

    /// Flush the trailing partial bucket
    pub fn finish(mut self) -> (Option<BulkBucket>, u64) {
        let last = self.take();
        (last, self.buckets_built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc-{:03}", i)).collect()
    }

    #[test]
    fn test_bucket_builder_cuts_at_size() {
        let mut builder = BucketBuilder::new("cmd", 3, 2);
        let mut buckets = Vec::new();
        for id in ids(7) {
            if let Some(bucket) = builder.push(id) {
                buckets.push(bucket);
            }
        }
        let (last, count) = builder.finish();
        buckets.extend(last);

        assert_eq!(count, 3);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].ids, vec!["doc-000", "doc-001", "doc-002"]);
        assert_eq!(buckets[2].len(), 1);
    }

    #[test]
    fn test_round_robin_assignment() {
        let mut builder = BucketBuilder::new("cmd", 1, 3);
        let placements: Vec<(u32, u64)> = ids(7)
            .into_iter()
            .filter_map(|id| builder.push(id))
            .map(|b| (b.partition, b.sequence))
            .collect();

        assert_eq!(
            placements,
            vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1), (0, 2)]
        );
    }

    #[test]
    fn test_assignment_is_deterministic() {
        assert_eq!(assign_partition(10, 4), (2, 2));
        assert_eq!(assign_partition(10, 4), assign_partition(10, 4));
        assert_eq!(assign_partition(5, 0), (0, 5));
    }

    #[test]
    fn test_empty_builder() {
        let builder = BucketBuilder::new("cmd", 10, 1);
        assert!(builder.is_empty());
        let (last, count) = builder.finish();
        assert!(last.is_none());
        assert_eq!(count, 0);
    }
}
