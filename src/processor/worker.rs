//! Action worker
//!
//! Processes the buckets of the partitions it owns. A record that fails,
//! either by returning an error or by panicking, is counted and the bucket
//! goes on. After the bucket the delta is published first and the offset
//! committed second: a crash between the two redelivers the bucket, and the
//! redelivered delta carries the same dedup key.
//!
//! The result of each applied bucket is recorded before its delta goes out.
//! A bucket that arrives again, redelivered or published by a second scroll
//! of the same command, replays that result and leaves the records alone.

use super::{join_group, Control};
use crate::action::{ActionHandler, ActionRegistry};
use crate::bulk::{BulkBucket, BulkCommand, Parameters, StatusDelta, StatusMessage};
use crate::error::Result;
use crate::log::{
    publish_json, LogConsumer, PartitionedLog, BUCKET_TOPIC, STATUS_TOPIC, WORKER_GROUP,
};
use crate::store::CommandStore;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Commands kept in the per-worker cache
const COMMAND_CACHE_SIZE: usize = 1024;

/// Worker of the `bulk-workers` consumer group
pub struct ActionWorker {
    index: usize,
    partitions: Vec<u32>,
    log: Arc<dyn PartitionedLog>,
    commands: Arc<CommandStore>,
    actions: Arc<ActionRegistry>,
    control: Control,
    poll_interval: Duration,
    max_poll_records: usize,
    cache: HashMap<String, Arc<BulkCommand>>,
}

impl ActionWorker {
    /// Create a worker owning `partitions`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        partitions: Vec<u32>,
        log: Arc<dyn PartitionedLog>,
        commands: Arc<CommandStore>,
        actions: Arc<ActionRegistry>,
        control: Control,
        poll_interval: Duration,
        max_poll_records: usize,
    ) -> Self {
        Self {
            index,
            partitions,
            log,
            commands,
            actions,
            control,
            poll_interval,
            max_poll_records: max_poll_records.max(1),
            cache: HashMap::new(),
        }
    }

    /// Process buckets until shutdown
    pub fn run(mut self) {
        let Some(mut consumer) = join_group(
            &self.log,
            BUCKET_TOPIC,
            WORKER_GROUP,
            &self.partitions,
            &self.control,
            self.poll_interval,
        ) else {
            return;
        };
        info!(worker = self.index, partitions = ?consumer.assignment(), "Worker started");

        loop {
            if self.control.is_shutdown() || self.control.is_abandoned() {
                break;
            }
            match self.poll_once(&mut consumer) {
                Ok(0) => {
                    if self.control.wait(self.poll_interval) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(worker = self.index, error = %e, "Worker poll failed");
                    if self.control.wait(self.poll_interval) {
                        break;
                    }
                }
            }
        }

        info!(worker = self.index, "Worker stopped");
    }

    /// Process available buckets, returns how many were committed
    ///
    /// Stops between buckets once shutdown is requested.
    pub fn poll_once(&mut self, consumer: &mut LogConsumer) -> Result<usize> {
        let mut committed = 0;
        for record in consumer.poll(self.max_poll_records)? {
            if self.control.is_shutdown() {
                break;
            }

            let bucket: BulkBucket = match record.decode() {
                Ok(bucket) => bucket,
                Err(e) => {
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Skipping undecodable bucket"
                    );
                    consumer.commit(&record)?;
                    continue;
                }
            };

            let Some(delta) = self.process(&bucket)? else {
                debug!(
                    command_id = %bucket.command_id,
                    partition = bucket.partition,
                    sequence = bucket.sequence,
                    "Bucket abandoned"
                );
                break;
            };

            publish_json(
                self.log.as_ref(),
                STATUS_TOPIC,
                0,
                &StatusMessage::Processed(delta),
            )?;
            consumer.commit(&record)?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Apply the command's action to every record of a bucket
    ///
    /// Returns `None` when the bucket was abandoned mid-way.
    pub fn process(&mut self, bucket: &BulkBucket) -> Result<Option<StatusDelta>> {
        if let Some(delta) =
            self.commands
                .bucket_result(&bucket.command_id, bucket.partition, bucket.sequence)?
        {
            debug!(
                worker = self.index,
                command_id = %bucket.command_id,
                partition = bucket.partition,
                sequence = bucket.sequence,
                "Bucket already applied"
            );
            return Ok(Some(delta));
        }

        let mut errors = 0u64;
        let mut error_message = None;

        match self.command(&bucket.command_id)? {
            None => {
                warn!(command_id = %bucket.command_id, "Bucket for unknown command");
                errors = bucket.len() as u64;
                error_message = Some(format!("Unknown command '{}'", bucket.command_id));
            }
            Some(command) => match self.actions.get(&command.action) {
                None => {
                    errors = bucket.len() as u64;
                    error_message = Some(format!("Unknown action '{}'", command.action));
                }
                Some(handler) => {
                    for id in &bucket.ids {
                        if self.control.is_abandoned() {
                            return Ok(None);
                        }
                        if let Err(message) =
                            apply_isolated(handler.as_ref(), id, &command.parameters)
                        {
                            errors += 1;
                            error_message = Some(message);
                        }
                    }
                }
            },
        }

        debug!(
            worker = self.index,
            command_id = %bucket.command_id,
            partition = bucket.partition,
            sequence = bucket.sequence,
            records = bucket.len(),
            errors,
            "Bucket processed"
        );

        let delta = StatusDelta {
            command_id: bucket.command_id.clone(),
            partition: bucket.partition,
            sequence: bucket.sequence,
            processed: bucket.len() as u64,
            errors,
            error_message,
        };
        self.commands.record_bucket_result(&delta)?;
        Ok(Some(delta))
    }

    fn command(&mut self, id: &str) -> Result<Option<Arc<BulkCommand>>> {
        if let Some(command) = self.cache.get(id) {
            return Ok(Some(command.clone()));
        }
        let Some(command) = self.commands.get_command(id)? else {
            return Ok(None);
        };
        if self.cache.len() >= COMMAND_CACHE_SIZE {
            self.cache.clear();
        }
        let command = Arc::new(command);
        self.cache.insert(id.to_string(), command.clone());
        Ok(Some(command))
    }
}

/// Apply an action to one record, turning errors and panics into a message
fn apply_isolated(
    handler: &dyn ActionHandler,
    record_id: &str,
    parameters: &Parameters,
) -> std::result::Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.apply(record_id, parameters))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!(
            "Action panicked on record '{}': {}",
            record_id,
            panic_message(payload.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
