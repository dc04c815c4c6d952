//! Partitioned log for work distribution
//!
//! An append-only, partitioned, at-least-once log with consumer groups.
//! Each consumer group keeps one committed offset per partition: the next
//! offset to read. A record is redelivered until its offset is committed.
//!
//! Three topics carry all traffic between components:
//!
//! ```text
//! submit ──► bulk-commands (1) ──► scroller ──► bulk-buckets (P) ──► workers
//!                                      │                               │
//!                                      └────► bulk-status (1) ◄────────┘
//!                                                   │
//!                                               aggregator ──► command store
//! ```

mod consumer;
mod sqlite;

pub use consumer::{owned_partitions, LogConsumer};
pub use sqlite::SqliteLog;

use crate::error::LogResult;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Topic carrying submitted commands
pub const COMMAND_TOPIC: &str = "bulk-commands";

/// Topic carrying buckets of record ids
pub const BUCKET_TOPIC: &str = "bulk-buckets";

/// Topic carrying scroll markers and bucket deltas
pub const STATUS_TOPIC: &str = "bulk-status";

/// Consumer group of the scroller
pub const SCROLLER_GROUP: &str = "bulk-scroller";

/// Consumer group of the action workers
pub const WORKER_GROUP: &str = "bulk-workers";

/// Consumer group of the status aggregator
pub const AGGREGATOR_GROUP: &str = "bulk-aggregator";

/// A record read from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Partition the record was read from
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
    /// JSON payload
    pub payload: String,
}

impl LogRecord {
    /// Decode the JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> LogResult<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Trait for partitioned log implementations
pub trait PartitionedLog: Send + Sync {
    /// Create a topic; a no-op if it exists with the same partition count
    fn create_topic(&self, topic: &str, partitions: u32) -> LogResult<()>;

    /// Partition count of a topic
    fn partitions(&self, topic: &str) -> LogResult<u32>;

    /// Append a payload, returning its offset
    fn publish(&self, topic: &str, partition: u32, payload: &str) -> LogResult<u64>;

    /// Read up to `max` records starting at offset `from`
    fn read(&self, topic: &str, partition: u32, from: u64, max: usize)
        -> LogResult<Vec<LogRecord>>;

    /// Offset the next published record will get
    fn end_offset(&self, topic: &str, partition: u32) -> LogResult<u64>;

    /// Next offset to read for a consumer group (0 if never committed)
    fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> LogResult<u64>;

    /// Commit the next offset to read for a consumer group
    fn commit_offset(&self, topic: &str, group: &str, partition: u32, next: u64)
        -> LogResult<()>;
}

/// Serialize a message and publish it
pub fn publish_json<T: Serialize>(
    log: &dyn PartitionedLog,
    topic: &str,
    partition: u32,
    message: &T,
) -> LogResult<u64> {
    let payload = serde_json::to_string(message)?;
    log.publish(topic, partition, &payload)
}

/// Records published but not yet committed by `group`, over every partition
pub fn consumer_lag(log: &dyn PartitionedLog, topic: &str, group: &str) -> LogResult<u64> {
    let mut lag = 0;
    for partition in 0..log.partitions(topic)? {
        let end = log.end_offset(topic, partition)?;
        let committed = log.committed_offset(topic, group, partition)?;
        lag += end.saturating_sub(committed);
    }
    Ok(lag)
}

/// Create the engine's three topics
pub fn create_engine_topics(log: &dyn PartitionedLog, bucket_partitions: u32) -> LogResult<()> {
    log.create_topic(COMMAND_TOPIC, 1)?;
    log.create_topic(BUCKET_TOPIC, bucket_partitions)?;
    log.create_topic(STATUS_TOPIC, 1)?;
    Ok(())
}
