//! Consumer group member over a set of owned partitions

use crate::error::LogResult;
use crate::log::{LogRecord, PartitionedLog};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Partitions owned by member `index` of a group of `members`
///
/// Member `i` owns every partition `p` with `p % members == i`.
pub fn owned_partitions(index: usize, members: usize, partitions: u32) -> Vec<u32> {
    let members = members.max(1);
    (0..partitions)
        .filter(|p| (*p as usize) % members == index)
        .collect()
}

/// Reads owned partitions from their committed offsets
///
/// The in-memory position advances only on [`LogConsumer::commit`], so a
/// record that was read but not committed is read again by the next poll and
/// redelivered to the next consumer of the partition.
pub struct LogConsumer {
    log: Arc<dyn PartitionedLog>,
    topic: String,
    group: String,
    positions: BTreeMap<u32, u64>,
}

impl LogConsumer {
    /// Join `group` on `topic` owning `partitions`
    pub fn assign(
        log: Arc<dyn PartitionedLog>,
        topic: &str,
        group: &str,
        partitions: &[u32],
    ) -> LogResult<Self> {
        let mut positions = BTreeMap::new();
        for &partition in partitions {
            positions.insert(partition, log.committed_offset(topic, group, partition)?);
        }
        Ok(Self {
            log,
            topic: topic.to_string(),
            group: group.to_string(),
            positions,
        })
    }

    /// Owned partitions
    pub fn assignment(&self) -> Vec<u32> {
        self.positions.keys().copied().collect()
    }

    /// Fetch up to `max_per_partition` uncommitted records from every owned
    /// partition, in partition order then offset order
    pub fn poll(&self, max_per_partition: usize) -> LogResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        for (&partition, &from) in &self.positions {
            records.extend(
                self.log
                    .read(&self.topic, partition, from, max_per_partition)?,
            );
        }
        Ok(records)
    }

    /// Commit a processed record
    pub fn commit(&mut self, record: &LogRecord) -> LogResult<()> {
        let next = record.offset + 1;
        self.log
            .commit_offset(&self.topic, &self.group, record.partition, next)?;
        if let Some(position) = self.positions.get_mut(&record.partition) {
            *position = (*position).max(next);
        }
        Ok(())
    }
}
