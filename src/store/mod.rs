//! SQLite persistence for commands, statuses and migrations
//!
//! Every component opens its own connection on the same database file and
//! relies on WAL mode plus a busy timeout for concurrent access. Writes that
//! read before they write use immediate transactions.

pub mod commands;
pub mod migrations;
pub mod schema;

pub use commands::{CommandStore, MergeOutcome};
pub use migrations::{GuardOutcome, MigrationRecord, MigrationStore};
pub use schema::{create_database, keys, open_database, open_in_memory};
