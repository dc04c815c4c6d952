//! bulk-engine - Bulk Action Framework and Migration Engine
//!
//! Applies a named action to every record matched by a query, asynchronously
//! and resumably, and runs data migrations as sequences of such commands.
//!
//! # Features
//!
//! - **Partitioned Log**: Work flows through a durable, at-least-once log
//!   with consumer groups and committed offsets, stored in SQLite.
//!
//! - **Exactly-Once Counting**: Every bucket carries a `(command, partition,
//!   sequence)` key; a redelivered bucket never counts twice.
//!
//! - **Failure Isolation**: A record that errors or panics is counted on the
//!   command's status and never stops its bucket.
//!
//! - **Resumable**: Stopping the processor and starting it again, with any
//!   worker count, continues from the committed offsets.
//!
//! - **Migrations**: States inferred from the data by probe queries, steps
//!   run as bulk commands, a persisted single-flight guard per migration.
//!
//! # Architecture
//!
//! ```text
//!   submit ──► ┌───────────────┐
//!              │ bulk-commands │
//!              └───────┬───────┘
//!                      ▼
//!              ┌───────────────┐  pages   ┌──────────────────┐
//!              │   Scroller    │ ◄─────── │ SelectionEngine  │
//!              └───────┬───────┘          └──────────────────┘
//!                      │ buckets (round robin)
//!                      ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │                 bulk-buckets (P)                │
//!   └────┬──────────────┬──────────────────────┬──────┘
//!        ▼              ▼                      ▼
//!   ┌─────────┐    ┌─────────┐            ┌─────────┐
//!   │Worker 0 │    │Worker 1 │    ...     │Worker N │ ──► ActionHandler
//!   └────┬────┘    └────┬────┘            └────┬────┘
//!        └──────────────┼──────────────────────┘
//!                       ▼ deltas
//!              ┌───────────────┐          ┌──────────────────┐
//!              │  bulk-status  │ ───────► │    Aggregator    │
//!              └───────────────┘          │ (single writer)  │
//!                                         └────────┬─────────┘
//!                                                  ▼
//!                                         ┌──────────────────┐
//!                                         │   bulk_status    │
//!                                         └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Create documents, then update them all and wait
//! bulk-engine seed --count 1000
//! bulk-engine submit --action setProperties --query "type = 'File'" --param status=done --wait
//!
//! # Serve the status API
//! bulk-engine serve --bind 127.0.0.1:8080
//! curl http://127.0.0.1:8080/bulk/<command-id>
//! ```

pub mod action;
pub mod bulk;
pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod migration;
pub mod processor;
pub mod progress;
pub mod selection;
pub mod server;
pub mod store;

pub use bulk::{BulkCommand, BulkService, BulkState, BulkStatus};
pub use config::{CliArgs, EngineConfig};
pub use engine::Engine;
pub use error::{BulkError, Result};
pub use migration::{MigrationService, MigrationStatusView};
pub use processor::BulkProcessor;
