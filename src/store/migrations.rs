//! Durable migration status rows
//!
//! The `running` column is the single-flight guard of a migration. It is only
//! ever raised by one conditional `UPDATE ... WHERE running = 0 AND state = ?`
//! and only ever lowered by statements conditioned on `running = 1`, so two
//! callers can never both own a migration.

use super::schema;
use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

const SELECT_MIGRATION: &str = "SELECT migration_id, state, running, step, command_id, \
     last_error, updated_at FROM migration_status";

/// Persisted state of one migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    /// Migration id
    pub migration_id: String,
    /// Current state name
    pub state: String,
    /// Whether a step's command is in flight
    pub running: bool,
    /// Running or last run step
    pub step: Option<String>,
    /// In-flight or last command id
    pub command_id: Option<String>,
    /// Error of the last failed step
    pub last_error: Option<String>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Result of trying to take the single-flight guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The caller owns the migration until the step is finalized
    Acquired,
    /// Another step is running
    Running { step: Option<String> },
    /// The persisted state is not the step's source state
    StateMismatch { actual: String },
    /// No row for this migration yet
    Missing,
}

/// SQLite-backed migration status store
pub struct MigrationStore {
    conn: Mutex<Connection>,
}

impl MigrationStore {
    /// Open a store on a database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open_database(path)?),
        })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open_in_memory()?),
        })
    }

    /// Look up a migration row
    pub fn get(&self, migration_id: &str) -> StoreResult<Option<MigrationRecord>> {
        let conn = self.conn.lock();
        read_record(&conn, migration_id)
    }

    /// Every migration row, by id
    pub fn list(&self) -> StoreResult<Vec<MigrationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY migration_id", SELECT_MIGRATION))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Store a probed state, unless a step is running
    ///
    /// Creates the row on first use. Returns the row as persisted afterwards.
    pub fn record_probed_state(
        &self,
        migration_id: &str,
        state: &str,
    ) -> StoreResult<MigrationRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO migration_status (migration_id, state, running, updated_at) \
             VALUES (?1, ?2, 0, ?3) \
             ON CONFLICT(migration_id) DO UPDATE SET state = excluded.state, \
             updated_at = excluded.updated_at WHERE running = 0",
            params![migration_id, state, Utc::now()],
        )?;
        expect_record(&conn, migration_id)
    }

    /// Take the single-flight guard for `step` if the migration is idle in `from_state`
    ///
    /// The id of the command that will run the step is recorded in the same
    /// statement, so a running row always names its command.
    pub fn try_begin(
        &self,
        migration_id: &str,
        step: &str,
        from_state: &str,
        command_id: &str,
    ) -> StoreResult<GuardOutcome> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE migration_status SET running = 1, step = ?2, command_id = ?4, \
             last_error = NULL, updated_at = ?5 \
             WHERE migration_id = ?1 AND running = 0 AND state = ?3",
            params![migration_id, step, from_state, command_id, Utc::now()],
        )?;
        if changed == 1 {
            return Ok(GuardOutcome::Acquired);
        }

        Ok(match read_record(&conn, migration_id)? {
            None => GuardOutcome::Missing,
            Some(record) if record.running => GuardOutcome::Running { step: record.step },
            Some(record) => GuardOutcome::StateMismatch {
                actual: record.state,
            },
        })
    }

    /// Finish the step run by `command_id`
    ///
    /// `new_state` is `Some` only for a clean completion. Returns false when
    /// the step was already finalized, so repeated calls change nothing.
    pub fn finalize(
        &self,
        migration_id: &str,
        command_id: &str,
        new_state: Option<&str>,
        last_error: Option<&str>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE migration_status SET running = 0, state = COALESCE(?3, state), \
             last_error = ?4, updated_at = ?5 \
             WHERE migration_id = ?1 AND running = 1 AND command_id = ?2",
            params![migration_id, command_id, new_state, last_error, Utc::now()],
        )?;
        Ok(changed == 1)
    }
}

fn read_record(conn: &Connection, migration_id: &str) -> StoreResult<Option<MigrationRecord>> {
    let record = conn
        .query_row(
            &format!("{} WHERE migration_id = ?1", SELECT_MIGRATION),
            [migration_id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn expect_record(conn: &Connection, migration_id: &str) -> StoreResult<MigrationRecord> {
    let record = conn.query_row(
        &format!("{} WHERE migration_id = ?1", SELECT_MIGRATION),
        [migration_id],
        record_from_row,
    )?;
    Ok(record)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationRecord> {
    Ok(MigrationRecord {
        migration_id: row.get(0)?,
        state: row.get(1)?,
        running: row.get(2)?,
        step: row.get(3)?,
        command_id: row.get(4)?,
        last_error: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
