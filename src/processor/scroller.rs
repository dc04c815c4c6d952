//! Command scroller
//!
//! Turns each submitted command into buckets of record ids. Bucket `i` goes
//! to partition `i % P` with sequence `i / P`, then a `ScrollCompleted`
//! marker carries the exact total and bucket count. A selection or log
//! failure publishes `ScrollFailed` instead; buckets already published stay
//! and are still processed. The command offset is committed only after one
//! of the two terminal markers is on the status topic.

use super::{join_group, Control};
use crate::bulk::{BucketBuilder, BulkCommand, StatusMessage};
use crate::error::Result;
use crate::log::{
    publish_json, LogConsumer, PartitionedLog, BUCKET_TOPIC, COMMAND_TOPIC, SCROLLER_GROUP,
    STATUS_TOPIC,
};
use crate::selection::SelectionEngine;
use crate::store::CommandStore;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollOutcome {
    /// Every bucket and the completion marker were published
    Completed { total: u64, buckets: u64 },
    /// The failure marker was published
    Failed(String),
    /// Unknown or already terminal command
    Skipped,
    /// Stopped before the end; the command will be scrolled again
    Interrupted,
}

/// Consumer of the command topic
pub struct Scroller {
    log: Arc<dyn PartitionedLog>,
    commands: Arc<CommandStore>,
    selection: Arc<dyn SelectionEngine>,
    control: Control,
    poll_interval: Duration,
}

impl Scroller {
    /// Create a scroller
    pub fn new(
        log: Arc<dyn PartitionedLog>,
        commands: Arc<CommandStore>,
        selection: Arc<dyn SelectionEngine>,
        control: Control,
        poll_interval: Duration,
    ) -> Self {
        Self {
            log,
            commands,
            selection,
            control,
            poll_interval,
        }
    }

    /// Consume commands until shutdown
    pub fn run(self) {
        let Some(mut consumer) = join_group(
            &self.log,
            COMMAND_TOPIC,
            SCROLLER_GROUP,
            &[0],
            &self.control,
            self.poll_interval,
        ) else {
            return;
        };
        info!("Scroller started");

        loop {
            if self.control.is_shutdown() {
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
                    error!(error = %e, "Scroller poll failed");
                    if self.control.wait(self.poll_interval) {
                        break;
                    }
                }
            }
        }

        info!("Scroller stopped");
    }

    /// Scroll the next pending command, returns how many were handled
    pub fn poll_once(&self, consumer: &mut LogConsumer) -> Result<usize> {
        let mut handled = 0;
        for record in consumer.poll(1)? {
            let command: BulkCommand = match record.decode() {
                Ok(command) => command,
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "Skipping undecodable command");
                    consumer.commit(&record)?;
                    continue;
                }
            };

            if self.scroll(&command)? == ScrollOutcome::Interrupted {
                return Ok(handled);
            }
            consumer.commit(&record)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Scroll one command and publish its markers
    pub fn scroll(&self, command: &BulkCommand) -> Result<ScrollOutcome> {
        match self.commands.get_status(&command.id)? {
            None => {
                warn!(command_id = %command.id, "No status for command, skipping");
                return Ok(ScrollOutcome::Skipped);
            }
            Some(status) if status.is_terminal() => {
                debug!(command_id = %command.id, state = %status.state, "Command already terminal");
                return Ok(ScrollOutcome::Skipped);
            }
            Some(_) => {}
        }

        match self.publish_buckets(command) {
            Ok(Some((total, buckets))) => {
                let marker = StatusMessage::ScrollCompleted {
                    command_id: command.id.clone(),
                    total,
                    bucket_count: buckets,
                };
                publish_json(self.log.as_ref(), STATUS_TOPIC, 0, &marker)?;
                info!(command_id = %command.id, total, buckets, "Scroll completed");
                Ok(ScrollOutcome::Completed { total, buckets })
            }
            Ok(None) => {
                info!(command_id = %command.id, "Scroll abandoned, the command will be scrolled again");
                Ok(ScrollOutcome::Interrupted)
            }
            Err(e) => {
                let message = e.to_string();
                error!(command_id = %command.id, error = %message, "Scroll failed");
                let marker = StatusMessage::ScrollFailed {
                    command_id: command.id.clone(),
                    message: message.clone(),
                };
                publish_json(self.log.as_ref(), STATUS_TOPIC, 0, &marker)?;
                Ok(ScrollOutcome::Failed(message))
            }
        }
    }

    /// Publish every bucket, returns `(records, buckets)` or `None` if abandoned
    fn publish_buckets(&self, command: &BulkCommand) -> Result<Option<(u64, u64)>> {
        let partitions = self.log.partitions(BUCKET_TOPIC)?;
        let total = self.selection.count(&command.query)?;
        publish_json(
            self.log.as_ref(),
            STATUS_TOPIC,
            0,
            &StatusMessage::ScrollStarted {
                command_id: command.id.clone(),
                total,
            },
        )?;
        debug!(command_id = %command.id, ?total, partitions, "Scroll started");

        let mut cursor = self.selection.scroll(&command.query, command.batch_size)?;
        let mut builder = BucketBuilder::new(&command.id, command.bucket_size, partitions);
        let mut scrolled = 0u64;

        while let Some(page) = cursor.next_page()? {
            if self.control.is_abandoned() {
                return Ok(None);
            }
            for id in page {
                scrolled += 1;
                if let Some(bucket) = builder.push(id) {
                    publish_json(self.log.as_ref(), BUCKET_TOPIC, bucket.partition, &bucket)?;
                }
            }
        }

        let (last, buckets) = builder.finish();
        if let Some(bucket) = last {
            publish_json(self.log.as_ref(), BUCKET_TOPIC, bucket.partition, &bucket)?;
        }

        Ok(Some((scrolled, buckets)))
    }
}
