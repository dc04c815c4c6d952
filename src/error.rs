//! Error types for bulk-engine
//!
//! This module defines the error hierarchy for:
//! - Command validation and lookup errors
//! - SQLite store errors
//! - Partitioned log errors
//! - Selection engine and action errors
//! - Migration state machine errors
//! - Configuration and CLI errors
//!
//! Record-level failures never surface through these types: a failing record
//! is counted on the command's status, not returned to a caller.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for bulk-engine
#[derive(Error, Debug)]
pub enum BulkError {
    /// Command rejected at submission time (never persisted)
    #[error("Invalid bulk command: {0}")]
    InvalidCommand(String),

    /// Unknown command id
    #[error("Bulk command with id={0} doesn't exist")]
    NotFound(String),

    /// Store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Partitioned log errors
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Selection engine errors
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Migration errors
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Processor thread errors
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulkError {
    /// Check if this error means the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BulkError::NotFound(_) | BulkError::Migration(MigrationError::UnknownMigration(_))
        )
    }
}

/// SQLite store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open the database file
    #[error("Failed to open database at '{path}': {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// JSON encoding of a stored column failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database written by a newer engine
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
}

/// Partitioned log errors
#[derive(Error, Debug)]
pub enum LogError {
    /// SQLite error in the log tables
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Topic was never created
    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    /// Partition outside the topic's range
    #[error("Partition {partition} out of range for topic '{topic}' ({partitions} partitions)")]
    InvalidPartition {
        topic: String,
        partition: u32,
        partitions: u32,
    },

    /// Topic exists with a different partition count
    #[error("Topic '{topic}' already has {existing} partitions, requested {requested}")]
    PartitionMismatch {
        topic: String,
        existing: u32,
        requested: u32,
    },

    /// Message could not be encoded or decoded
    #[error("Failed to serialize/deserialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backing storage could not be opened
    #[error("Log storage unavailable: {0}")]
    Unavailable(String),
}

/// Selection engine errors
#[derive(Error, Debug)]
pub enum SelectionError {
    /// Query could not be parsed
    #[error("Invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    /// Backend failure while scrolling or counting
    #[error("Selection backend failed: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for SelectionError {
    fn from(err: rusqlite::Error) -> Self {
        SelectionError::Backend(err.to_string())
    }
}

/// Per-record action errors
#[derive(Error, Debug, Clone)]
pub enum ActionError {
    /// Record does not exist (deleted since the scroll)
    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    /// Parameter missing or invalid
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Handler failed on a record
    #[error("Action failed on record '{record_id}': {reason}")]
    Failed { record_id: String, reason: String },
}

/// Migration state machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// No descriptor registered under this id
    #[error("Unknown migration '{0}'")]
    UnknownMigration(String),

    /// Step name, descriptor content or request is invalid
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// The step is not a legal transition from the persisted state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Another step of the same migration is already running
    #[error("Migration '{migration_id}' is already running step '{step}'")]
    ConcurrencyConflict { migration_id: String, step: String },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid partition count
    #[error("Invalid partition count {count}: must be between 1 and {max}")]
    InvalidPartitionCount { count: u32, max: u32 },

    /// Invalid bucket or batch size
    #[error("Invalid {name} {size}: must be between 1 and {max}")]
    InvalidSize {
        name: &'static str,
        size: usize,
        max: usize,
    },

    /// Malformed key=value parameter
    #[error("Invalid parameter '{0}': expected key=value")]
    InvalidParameter(String),

    /// Migration descriptor file problem
    #[error("Invalid migrations file '{path}': {reason}")]
    InvalidMigrations { path: PathBuf, reason: String },
}

/// Processor thread errors
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Processor already running
    #[error("Processor is already running")]
    AlreadyRunning,

    /// Thread could not be spawned
    #[error("Failed to spawn thread '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// Threads of a previous run never exited and still own their partitions
    #[error("{threads} consumer threads of the previous run are still running")]
    StillStopping { threads: usize },
}

/// Status API errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request parameter
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Engine error behind the endpoint
    #[error("{0}")]
    Engine(#[from] BulkError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        let status = match &self {
            ServerError::Engine(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ServerError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<MigrationError> for ServerError {
    fn from(e: MigrationError) -> Self {
        ServerError::Engine(e.into())
    }
}

/// Result type alias for BulkError
pub type Result<T> = std::result::Result<T, BulkError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for LogError
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Result type alias for SelectionError
pub type SelectionResult<T> = std::result::Result<T, SelectionError>;

/// Result type alias for ActionError
pub type ActionResult<T> = std::result::Result<T, ActionError>;

/// Result type alias for ServerError
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = BulkError::NotFound("abc".into());
        assert_eq!(err.to_string(), "Bulk command with id=abc doesn't exist");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_conversion() {
        let conflict = MigrationError::ConcurrencyConflict {
            migration_id: "m".into(),
            step: "s".into(),
        };
        let err: BulkError = conflict.clone().into();
        assert!(matches!(err, BulkError::Migration(ref m) if *m == conflict));
        assert!(!err.is_not_found());

        let unknown: BulkError = MigrationError::UnknownMigration("m".into()).into();
        assert!(unknown.is_not_found());
    }
}
