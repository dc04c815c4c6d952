//! Bulk commands, statuses, buckets and the public bulk service
//!
//! A command is submitted once, scrolled into buckets by the scroller,
//! processed bucket by bucket by the worker pool, and tracked through a
//! single [`BulkStatus`] row merged by the status aggregator.

pub mod bucket;
pub mod command;
pub mod service;
pub mod status;

pub use bucket::{assign_partition, BucketBuilder, BulkBucket};
pub use command::{
    param_keys, BulkCommand, BulkCommandBuilder, Parameters, DEFAULT_BATCH_SIZE,
    DEFAULT_BUCKET_SIZE, DEFAULT_REPOSITORY, SYSTEM_USERNAME,
};
pub use service::{BulkService, Deadline};
pub use status::{BulkState, BulkStatus, StatusDelta, StatusMessage, UNKNOWN_TOTAL};
