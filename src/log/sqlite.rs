//! SQLite-backed partitioned log
//!
//! Records and committed offsets live in the engine database, so a restart
//! resumes every consumer group exactly where it committed:
//! - Offsets are dense per `(topic, partition)`, starting at 0
//! - Committed offsets only move forward
//! - Records are never deleted

use crate::error::{LogError, LogResult};
use crate::log::{LogRecord, PartitionedLog};
use crate::store::schema;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

/// Durable partitioned log
pub struct SqliteLog {
    conn: Mutex<Connection>,
}

impl SqliteLog {
    /// Open the log on a database file
    pub fn open(path: &Path) -> LogResult<Self> {
        let conn = schema::open_database(path).map_err(store_to_log)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory log
    pub fn open_in_memory() -> LogResult<Self> {
        let conn = schema::open_in_memory().map_err(store_to_log)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn topic_partitions(conn: &Connection, topic: &str) -> LogResult<u32> {
        conn.query_row(
            "SELECT partitions FROM log_topics WHERE topic = ?1",
            [topic],
            |row| row.get::<_, u32>(0),
        )
        .optional()?
        .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))
    }

    fn check_partition(conn: &Connection, topic: &str, partition: u32) -> LogResult<()> {
        let partitions = Self::topic_partitions(conn, topic)?;
        if partition >= partitions {
            return Err(LogError::InvalidPartition {
                topic: topic.to_string(),
                partition,
                partitions,
            });
        }
        Ok(())
    }
}

fn store_to_log(err: crate::error::StoreError) -> LogError {
    match err {
        crate::error::StoreError::Sqlite(e) => LogError::Sqlite(e),
        crate::error::StoreError::Serialization(e) => LogError::Serialization(e),
        other => LogError::Unavailable(other.to_string()),
    }
}

impl PartitionedLog for SqliteLog {
    fn create_topic(&self, topic: &str, partitions: u32) -> LogResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO log_topics (topic, partitions) VALUES (?1, ?2)",
            params![topic, partitions.max(1)],
        )?;
        let existing = Self::topic_partitions(&conn, topic)?;
        if existing != partitions.max(1) {
            return Err(LogError::PartitionMismatch {
                topic: topic.to_string(),
                existing,
                requested: partitions,
            });
        }
        Ok(())
    }

    fn partitions(&self, topic: &str) -> LogResult<u32> {
        let conn = self.conn.lock();
        Self::topic_partitions(&conn, topic)
    }

    fn publish(&self, topic: &str, partition: u32, payload: &str) -> LogResult<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::check_partition(&tx, topic, partition)?;

        let offset: i64 = tx.query_row(
            "SELECT COALESCE(MAX(record_offset) + 1, 0) FROM log_records \
             WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO log_records (topic, partition_id, record_offset, payload, appended_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![topic, partition, offset, payload, Utc::now()],
        )?;
        tx.commit()?;

        Ok(offset as u64)
    }

    fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> LogResult<Vec<LogRecord>> {
        let conn = self.conn.lock();
        Self::check_partition(&conn, topic, partition)?;

        let mut stmt = conn.prepare_cached(
            "SELECT record_offset, payload FROM log_records \
             WHERE topic = ?1 AND partition_id = ?2 AND record_offset >= ?3 \
             ORDER BY record_offset LIMIT ?4",
        )?;
        let records = stmt
            .query_map(params![topic, partition, from as i64, max as i64], |row| {
                Ok(LogRecord {
                    partition,
                    offset: row.get::<_, i64>(0)? as u64,
                    payload: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn end_offset(&self, topic: &str, partition: u32) -> LogResult<u64> {
        let conn = self.conn.lock();
        Self::check_partition(&conn, topic, partition)?;

        let end: i64 = conn.query_row(
            "SELECT COALESCE(MAX(record_offset) + 1, 0) FROM log_records \
             WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition],
            |row| row.get(0),
        )?;
        Ok(end as u64)
    }

    fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> LogResult<u64> {
        let conn = self.conn.lock();
        let next: Option<i64> = conn
            .query_row(
                "SELECT next_offset FROM log_offsets \
                 WHERE topic = ?1 AND consumer_group = ?2 AND partition_id = ?3",
                params![topic, group, partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.unwrap_or(0) as u64)
    }

    fn commit_offset(&self, topic: &str, group: &str, partition: u32, next: u64) -> LogResult<()> {
        let conn = self.conn.lock();
        Self::check_partition(&conn, topic, partition)?;

        conn.execute(
            "INSERT INTO log_offsets (topic, consumer_group, partition_id, next_offset) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(topic, consumer_group, partition_id) \
             DO UPDATE SET next_offset = MAX(next_offset, excluded.next_offset)",
            params![topic, group, partition, next as i64],
        )?;
        Ok(())
    }
}
