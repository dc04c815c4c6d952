//! Database schema definitions and creation
//!
//! This module defines the SQLite schema shared by the command store, the
//! migration store and the partitioned log, and opens connections with the
//! pragmas every component relies on.

use crate::error::{StoreError, StoreResult};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Current schema version
pub const SCHEMA_VERSION: u32 = 2;

/// How long a writer waits on a locked database before failing
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable bulk commands
const CREATE_COMMANDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS bulk_commands (
    id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    query TEXT NOT NULL,
    username TEXT NOT NULL,
    repository TEXT NOT NULL,
    parameters TEXT NOT NULL,     -- JSON object of string parameters
    bucket_size INTEGER NOT NULL,
    batch_size INTEGER NOT NULL,
    submitted_at TEXT NOT NULL
)
"#;

/// One mutable status row per command
const CREATE_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS bulk_status (
    command_id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    username TEXT NOT NULL,
    state TEXT NOT NULL,
    total INTEGER NOT NULL DEFAULT -1,   -- -1 until known
    processed INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    bucket_count INTEGER,                -- NULL until scrolling ended
    buckets_done INTEGER NOT NULL DEFAULT 0,
    submitted_at TEXT NOT NULL,
    scroll_started_at TEXT,
    scroll_ended_at TEXT,
    completed_at TEXT
)
"#;

/// Dedup keys of merged bucket deltas
const CREATE_APPLIED_BUCKETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS bulk_applied_buckets (
    command_id TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    sequence INTEGER NOT NULL,
    PRIMARY KEY (command_id, partition_id, sequence)
) WITHOUT ROWID
"#;

/// Outcome of each bucket a worker applied, replayed instead of re-applying
const CREATE_BUCKET_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS bulk_bucket_results (
    command_id TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    sequence INTEGER NOT NULL,
    processed INTEGER NOT NULL,
    errors INTEGER NOT NULL,
    error_message TEXT,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (command_id, partition_id, sequence)
) WITHOUT ROWID
"#;

/// Migration state machine rows
const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migration_status (
    migration_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    running INTEGER NOT NULL DEFAULT 0,  -- 0/1 single-flight guard
    step TEXT,
    command_id TEXT,
    last_error TEXT,
    updated_at TEXT NOT NULL
)
"#;

/// Log topics and their fixed partition counts
const CREATE_TOPICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_topics (
    topic TEXT PRIMARY KEY,
    partitions INTEGER NOT NULL
)
"#;

/// Append-only log records
const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_records (
    topic TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    record_offset INTEGER NOT NULL,
    payload TEXT NOT NULL,
    appended_at TEXT NOT NULL,
    PRIMARY KEY (topic, partition_id, record_offset)
) WITHOUT ROWID
"#;

/// Committed consumer group offsets (next offset to read)
const CREATE_OFFSETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_offsets (
    topic TEXT NOT NULL,
    consumer_group TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    next_offset INTEGER NOT NULL,
    PRIMARY KEY (topic, consumer_group, partition_id)
) WITHOUT ROWID
"#;

/// Engine metadata table
const CREATE_ENGINE_INFO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS engine_info (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_status_username ON bulk_status(username, submitted_at)",
    "CREATE INDEX IF NOT EXISTS idx_status_state ON bulk_status(state)",
];

/// Pragmas for concurrent readers and a single writer at a time
const CONNECTION_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;      -- 16MB cache
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

/// Open (or create) a database file with the engine schema
pub fn open_database(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path).map_err(|e| StoreError::OpenFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    create_database(&conn)?;
    Ok(conn)
}

/// Open a private in-memory database with the engine schema
pub fn open_in_memory() -> StoreResult<Connection> {
    let conn = Connection::open_in_memory()?;
    create_database(&conn)?;
    Ok(conn)
}

/// Configure a connection and create every table idempotently
pub fn create_database(conn: &Connection) -> StoreResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(CONNECTION_PRAGMAS)?;

    conn.execute(CREATE_COMMANDS_TABLE, [])?;
    conn.execute(CREATE_STATUS_TABLE, [])?;
    conn.execute(CREATE_APPLIED_BUCKETS_TABLE, [])?;
    conn.execute(CREATE_BUCKET_RESULTS_TABLE, [])?;
    conn.execute(CREATE_MIGRATIONS_TABLE, [])?;
    conn.execute(CREATE_TOPICS_TABLE, [])?;
    conn.execute(CREATE_RECORDS_TABLE, [])?;
    conn.execute(CREATE_OFFSETS_TABLE, [])?;
    conn.execute(CREATE_ENGINE_INFO_TABLE, [])?;

    for sql in CREATE_INDEXES {
        conn.execute(sql, [])?;
    }

    let found = get_engine_info(conn, keys::SCHEMA_VERSION)?.and_then(|v| v.parse::<u32>().ok());
    if let Some(found) = found.filter(|&v| v > SCHEMA_VERSION) {
        return Err(StoreError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    set_engine_info(conn, keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
    set_engine_info(conn, keys::ENGINE_VERSION, env!("CARGO_PKG_VERSION"))?;

    Ok(())
}

/// Store engine metadata
pub fn set_engine_info(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO engine_info (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Get engine metadata
pub fn get_engine_info(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM engine_info WHERE key = ?1",
        [key],
        |row| row.get(0),
    );

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Metadata keys stored in `engine_info`
pub mod keys {
    /// Schema version
    pub const SCHEMA_VERSION: &str = "schema_version";

    /// Version of the engine that last opened the database
    pub const ENGINE_VERSION: &str = "engine_version";
}
