//! Durable command and status store
//!
//! Commands are written once at submission. Status rows are only changed by
//! [`CommandStore::merge`], which applies one [`StatusMessage`] inside a
//! single immediate transaction:
//!
//! - bucket deltas are counted once per `(command, partition, sequence)`
//!   through an `INSERT OR IGNORE` into `bulk_applied_buckets`
//! - counts are incremented, never overwritten
//! - COMPLETED and ABORTED are never left once reached
//!
//! Workers also keep the result of every bucket they applied, so a bucket
//! delivered again (redelivery or a second scroll) is answered from the
//! recorded result instead of running the action twice.

use super::schema;
use crate::bulk::{BulkCommand, BulkState, BulkStatus, Parameters, StatusDelta, StatusMessage};
use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;

const SELECT_COMMAND: &str = "SELECT id, action, query, username, repository, parameters, \
     bucket_size, batch_size, submitted_at FROM bulk_commands";

const SELECT_STATUS: &str = "SELECT command_id, action, username, state, total, processed, \
     error_count, error_message, bucket_count, buckets_done, submitted_at, \
     scroll_started_at, scroll_ended_at, completed_at FROM bulk_status";

/// Result of merging one status message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The message changed the status; carries the resulting state
    Applied(BulkState),
    /// A delta with an already merged dedup key
    Duplicate,
    /// The status is terminal and the message could not change its state
    Ignored(BulkState),
    /// No status row for this command id
    UnknownCommand,
}

impl ToSql for BulkState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BulkState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// SQLite-backed store of commands and statuses
pub struct CommandStore {
    conn: Mutex<Connection>,
}

impl CommandStore {
    /// Open a store on a database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self::with_connection(schema::open_database(path)?))
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::with_connection(schema::open_in_memory()?))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Persist a new command together with its SCHEDULED status
    pub fn insert(&self, command: &BulkCommand) -> StoreResult<BulkStatus> {
        let status = BulkStatus::scheduled(
            &command.id,
            &command.action,
            &command.username,
            command.submitted_at,
        );
        let parameters = serde_json::to_string(&command.parameters)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO bulk_commands (id, action, query, username, repository, parameters, \
             bucket_size, batch_size, submitted_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                command.id,
                command.action,
                command.query,
                command.username,
                command.repository,
                parameters,
                command.bucket_size as i64,
                command.batch_size as i64,
                command.submitted_at,
            ],
        )?;
        tx.execute(
            "INSERT INTO bulk_status (command_id, action, username, state, total, submitted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                status.command_id,
                status.action,
                status.username,
                status.state,
                status.total,
                status.submitted_at,
            ],
        )?;
        tx.commit()?;

        Ok(status)
    }

    /// Look up a command
    pub fn get_command(&self, id: &str) -> StoreResult<Option<BulkCommand>> {
        let conn = self.conn.lock();
        let command = conn
            .query_row(&format!("{} WHERE id = ?1", SELECT_COMMAND), [id], command_from_row)
            .optional()?;
        Ok(command)
    }

    /// Look up a status
    pub fn get_status(&self, id: &str) -> StoreResult<Option<BulkStatus>> {
        let conn = self.conn.lock();
        read_status(&conn, id)
    }

    /// Statuses of every command submitted by `username`, newest first
    pub fn statuses_for_user(&self, username: &str) -> StoreResult<Vec<BulkStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE username = ?1 ORDER BY submitted_at DESC, command_id",
            SELECT_STATUS
        ))?;
        let statuses = stmt
            .query_map([username], status_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(statuses)
    }

    /// Number of commands per state
    pub fn count_by_state(&self) -> StoreResult<Vec<(BulkState, u64)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM bulk_status GROUP BY state ORDER BY state")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, BulkState>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Result recorded for an applied bucket, if any
    pub fn bucket_result(
        &self,
        command_id: &str,
        partition: u32,
        sequence: u64,
    ) -> StoreResult<Option<StatusDelta>> {
        let conn = self.conn.lock();
        let delta = conn
            .query_row(
                "SELECT processed, errors, error_message FROM bulk_bucket_results \
                 WHERE command_id = ?1 AND partition_id = ?2 AND sequence = ?3",
                params![command_id, partition, sequence as i64],
                |row| {
                    Ok(StatusDelta {
                        command_id: command_id.to_string(),
                        partition,
                        sequence,
                        processed: row.get::<_, i64>(0)? as u64,
                        errors: row.get::<_, i64>(1)? as u64,
                        error_message: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(delta)
    }

    /// Record that a bucket was applied; the first result recorded is kept
    pub fn record_bucket_result(&self, delta: &StatusDelta) -> StoreResult<bool> {
        let (command_id, partition, sequence) = delta.dedup_key();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO bulk_bucket_results \
             (command_id, partition_id, sequence, processed, errors, error_message, applied_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                command_id,
                partition,
                sequence as i64,
                delta.processed as i64,
                delta.errors as i64,
                delta.error_message,
                Utc::now()
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Merge one status message
    pub fn merge(&self, message: &StatusMessage) -> StoreResult<MergeOutcome> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(before) = read_state(&tx, message.command_id())? else {
            return Ok(MergeOutcome::UnknownCommand);
        };

        let outcome = match message {
            StatusMessage::ScrollStarted { command_id, total } => {
                let changed = tx.execute(
                    "UPDATE bulk_status SET state = ?2, \
                     scroll_started_at = COALESCE(scroll_started_at, ?3), \
                     total = COALESCE(?4, total) \
                     WHERE command_id = ?1 AND state IN ('SCHEDULED', 'SCROLLING_STARTED')",
                    params![
                        command_id,
                        BulkState::ScrollingStarted,
                        now,
                        total.map(|t| t as i64)
                    ],
                )?;
                if changed == 0 {
                    MergeOutcome::Ignored(before)
                } else {
                    MergeOutcome::Applied(BulkState::ScrollingStarted)
                }
            }
            StatusMessage::ScrollCompleted {
                command_id,
                total,
                bucket_count,
            } => {
                // Counts are recorded even on an aborted command
                tx.execute(
                    "UPDATE bulk_status SET total = ?2, bucket_count = ?3, \
                     scroll_started_at = COALESCE(scroll_started_at, ?4), \
                     scroll_ended_at = COALESCE(scroll_ended_at, ?4), \
                     state = CASE WHEN state IN ('COMPLETED', 'ABORTED') THEN state ELSE ?5 END \
                     WHERE command_id = ?1",
                    params![
                        command_id,
                        *total as i64,
                        *bucket_count as i64,
                        now,
                        BulkState::Running
                    ],
                )?;
                complete_if_done(&tx, command_id, now)?;
                outcome_after(&tx, command_id, before)?
            }
            StatusMessage::ScrollFailed {
                command_id,
                message,
            } => {
                let changed = tx.execute(
                    "UPDATE bulk_status SET state = ?2, error_message = ?3, \
                     scroll_ended_at = COALESCE(scroll_ended_at, ?4), completed_at = ?4 \
                     WHERE command_id = ?1 AND state NOT IN ('COMPLETED', 'ABORTED')",
                    params![command_id, BulkState::Aborted, message, now],
                )?;
                if changed == 0 {
                    MergeOutcome::Ignored(before)
                } else {
                    MergeOutcome::Applied(BulkState::Aborted)
                }
            }
            StatusMessage::Processed(delta) => {
                if apply_delta(&tx, delta)? {
                    complete_if_done(&tx, &delta.command_id, now)?;
                    outcome_after(&tx, &delta.command_id, before)?
                } else {
                    MergeOutcome::Duplicate
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}

/// Count a delta once; returns false for an already merged dedup key
fn apply_delta(tx: &Transaction<'_>, delta: &StatusDelta) -> StoreResult<bool> {
    let (command_id, partition, sequence) = delta.dedup_key();
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO bulk_applied_buckets (command_id, partition_id, sequence) \
         VALUES (?1, ?2, ?3)",
        params![command_id, partition, sequence as i64],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    // An aborted command keeps the message that aborted it
    tx.execute(
        "UPDATE bulk_status SET processed = processed + ?2, error_count = error_count + ?3, \
         buckets_done = buckets_done + 1, \
         error_message = CASE WHEN state = 'ABORTED' THEN error_message \
                              ELSE COALESCE(?4, error_message) END \
         WHERE command_id = ?1",
        params![
            command_id,
            delta.processed as i64,
            delta.errors as i64,
            delta.error_message
        ],
    )?;
    Ok(true)
}

fn complete_if_done(tx: &Transaction<'_>, command_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
    tx.execute(
        "UPDATE bulk_status SET state = ?2, completed_at = ?3 \
         WHERE command_id = ?1 AND state NOT IN ('COMPLETED', 'ABORTED') \
         AND bucket_count IS NOT NULL AND buckets_done >= bucket_count",
        params![command_id, BulkState::Completed, now],
    )?;
    Ok(())
}

fn outcome_after(
    tx: &Transaction<'_>,
    command_id: &str,
    before: BulkState,
) -> StoreResult<MergeOutcome> {
    if before.is_terminal() {
        return Ok(MergeOutcome::Ignored(before));
    }
    let after = read_state(tx, command_id)?.unwrap_or(before);
    Ok(MergeOutcome::Applied(after))
}

fn read_state(conn: &Connection, command_id: &str) -> StoreResult<Option<BulkState>> {
    let state = conn
        .query_row(
            "SELECT state FROM bulk_status WHERE command_id = ?1",
            [command_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(state)
}

fn read_status(conn: &Connection, command_id: &str) -> StoreResult<Option<BulkStatus>> {
    let status = conn
        .query_row(
            &format!("{} WHERE command_id = ?1", SELECT_STATUS),
            [command_id],
            status_from_row,
        )
        .optional()?;
    Ok(status)
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<BulkCommand> {
    let parameters: String = row.get(5)?;
    let parameters: Parameters = serde_json::from_str(&parameters).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(BulkCommand {
        id: row.get(0)?,
        action: row.get(1)?,
        query: row.get(2)?,
        username: row.get(3)?,
        repository: row.get(4)?,
        parameters,
        bucket_size: row.get::<_, i64>(6)? as usize,
        batch_size: row.get::<_, i64>(7)? as usize,
        submitted_at: row.get(8)?,
    })
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<BulkStatus> {
    Ok(BulkStatus {
        command_id: row.get(0)?,
        action: row.get(1)?,
        username: row.get(2)?,
        state: row.get(3)?,
        total: row.get(4)?,
        processed: row.get::<_, i64>(5)? as u64,
        error_count: row.get::<_, i64>(6)? as u64,
        error_message: row.get(7)?,
        bucket_count: row.get::<_, Option<i64>>(8)?.map(|c| c as u64),
        buckets_done: row.get::<_, i64>(9)? as u64,
        submitted_at: row.get(10)?,
        scroll_started_at: row.get(11)?,
        scroll_ended_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}
