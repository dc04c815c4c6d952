//! Configuration types for bulk-engine
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime engine configuration with validation
//! - `key=value` parameter parsing

use crate::bulk::{DEFAULT_BATCH_SIZE, DEFAULT_BUCKET_SIZE, DEFAULT_REPOSITORY, SYSTEM_USERNAME};
use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 512;

/// Maximum partition count of the bucket topic
const MAX_PARTITIONS: u32 = 256;

/// Upper bound for bucket and scroll page sizes
const MAX_SIZE: usize = 100_000;

/// Default partition count of the bucket topic
pub const DEFAULT_PARTITIONS: u32 = 4;

/// Regex for `key=value` parameters
static PARAM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_.-]*)=(.*)$").expect("Invalid parameter regex")
});

/// Bulk action engine with a migration state machine on top
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bulk-engine",
    version,
    about = "Apply an action to every record matched by a query, resumably",
    long_about = "Runs bulk commands over a partitioned, durable log.\n\n\
                  Commands are scrolled into buckets, processed by a worker pool with\n\
                  per-record failure isolation, and tracked through a status that counts\n\
                  every bucket exactly once. Migrations run their steps as bulk commands.",
    after_help = "EXAMPLES:\n    \
        bulk-engine seed --count 20\n    \
        bulk-engine submit --action setProperties --query \"type = 'File'\" --param status=done --wait\n    \
        bulk-engine status 5f0c...\n    \
        bulk-engine serve --bind 127.0.0.1:8080 --migrations migrations.json\n    \
        bulk-engine migrate --migrations migrations.json run title-migration"
)]
pub struct CliArgs {
    /// Engine database file
    #[arg(
        long = "db",
        env = "BULK_ENGINE_DB",
        default_value = "bulk.db",
        value_name = "FILE",
        global = true
    )]
    pub database: PathBuf,

    /// Partitions of the bucket topic (fixed once the database exists)
    #[arg(short = 'p', long, default_value_t = DEFAULT_PARTITIONS, value_name = "NUM", global = true)]
    pub partitions: u32,

    /// Number of action worker threads
    #[arg(
        short = 'w',
        long,
        default_value_t = default_workers(),
        value_name = "NUM",
        global = true
    )]
    pub workers: usize,

    /// Idle poll interval in milliseconds
    #[arg(long, default_value = "100", value_name = "MS", global = true)]
    pub poll_ms: u64,

    /// Grace period for stopping the processor, in seconds
    #[arg(long, default_value = "10", value_name = "SECS", global = true)]
    pub grace_secs: u64,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the processor and the HTTP status API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8080", value_name = "ADDR")]
        bind: SocketAddr,

        /// Migration descriptors (JSON)
        #[arg(long, value_name = "FILE")]
        migrations: Option<PathBuf>,
    },

    /// Submit a bulk command
    Submit(SubmitArgs),

    /// Show the status of a bulk command
    Status {
        /// Command id
        id: String,
    },

    /// List the commands of a user, newest first
    List {
        /// Submitting user
        #[arg(short, long, default_value = SYSTEM_USERNAME)]
        user: String,
    },

    /// Create sample documents in the repository
    Seed {
        /// Number of documents
        #[arg(short, long, default_value = "100")]
        count: usize,

        /// Document type
        #[arg(long = "type", default_value = "File")]
        doc_type: String,

        /// Title for every document (default: "Document <n>")
        #[arg(long)]
        title: Option<String>,
    },

    /// Probe, run or inspect migrations
    Migrate {
        /// Migration descriptors (JSON)
        #[arg(long, value_name = "FILE")]
        migrations: PathBuf,

        #[command(subcommand)]
        action: MigrateAction,
    },
}

/// Arguments of `submit`
#[derive(clap::Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Registered action name
    #[arg(short, long)]
    pub action: String,

    /// Selection query
    #[arg(long)]
    pub query: String,

    /// Submitting user
    #[arg(short, long, default_value = SYSTEM_USERNAME)]
    pub user: String,

    /// Repository the query runs against
    #[arg(long, default_value = DEFAULT_REPOSITORY)]
    pub repository: String,

    /// Action parameter (can be repeated)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param, action = clap::ArgAction::Append)]
    pub params: Vec<(String, String)>,

    /// Record ids per bucket
    #[arg(long, default_value_t = DEFAULT_BUCKET_SIZE)]
    pub bucket_size: usize,

    /// Scroll page size
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Process the command in this process and wait for it
    #[arg(long)]
    pub wait: bool,

    /// Wait timeout in seconds
    #[arg(long, default_value = "300", value_name = "SECS")]
    pub timeout: u64,
}

/// Migration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum MigrateAction {
    /// Infer and store the current state
    Probe {
        /// Migration id
        id: String,
    },

    /// Run a step (default: the first step from the probed state) and wait
    Run {
        /// Migration id
        id: String,

        /// Step name
        step: Option<String>,

        /// Wait timeout in seconds
        #[arg(long, default_value = "300", value_name = "SECS")]
        timeout: u64,
    },

    /// Show the migration status
    Status {
        /// Migration id
        id: String,
    },
}

/// Get default worker count based on CPU count
fn default_workers() -> usize {
    num_cpus::get().clamp(1, MAX_WORKERS)
}

/// Parse a `key=value` parameter
pub fn parse_param(s: &str) -> Result<(String, String), ConfigError> {
    let caps = PARAM_REGEX
        .captures(s)
        .ok_or_else(|| ConfigError::InvalidParameter(s.to_string()))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// Validated engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine database file, `None` for a private in-memory engine
    pub database: Option<PathBuf>,

    /// Partitions of the bucket topic
    pub partitions: u32,

    /// Number of action worker threads
    pub workers: usize,

    /// Idle poll interval of every consumer and of `await`
    pub poll_interval: Duration,

    /// Grace period for [`crate::processor::BulkProcessor::restart`]
    pub stop_grace: Duration,

    /// Records fetched per partition and poll
    pub max_poll_records: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: None,
            partitions: DEFAULT_PARTITIONS,
            workers: default_workers(),
            poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(10),
            max_poll_records: 16,
        }
    }
}

impl EngineConfig {
    /// In-memory configuration for tests and embedding
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set the partition count
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the database file
    pub fn with_database(mut self, path: PathBuf) -> Self {
        self.database = Some(path);
        self
    }

    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let config = Self {
            database: Some(args.database.clone()),
            partitions: args.partitions,
            workers: args.workers,
            poll_interval: Duration::from_millis(args.poll_ms.max(1)),
            stop_grace: Duration::from_secs(args.grace_secs),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every bound
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: self.workers,
                max: MAX_WORKERS,
            });
        }

        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            return Err(ConfigError::InvalidPartitionCount {
                count: self.partitions,
                max: MAX_PARTITIONS,
            });
        }

        validate_size("max poll records", self.max_poll_records)?;

        Ok(())
    }
}

/// Check a bucket or page size
pub fn validate_size(name: &'static str, size: usize) -> Result<(), ConfigError> {
    if size == 0 || size > MAX_SIZE {
        return Err(ConfigError::InvalidSize {
            name,
            size,
            max: MAX_SIZE,
        });
    }
    Ok(())
}
