//! Status aggregator
//!
//! The only writer of bulk statuses. Each message of the single-partition
//! status topic is merged into the command store in its own transaction and
//! committed afterwards; a redelivered message merges to the same result.

use super::{join_group, Control};
use crate::bulk::{BulkState, StatusMessage};
use crate::error::Result;
use crate::log::{LogConsumer, PartitionedLog, AGGREGATOR_GROUP, STATUS_TOPIC};
use crate::store::{CommandStore, MergeOutcome};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consumer of the status topic
pub struct Aggregator {
    log: Arc<dyn PartitionedLog>,
    commands: Arc<CommandStore>,
    control: Control,
    poll_interval: Duration,
    max_poll_records: usize,
}

impl Aggregator {
    /// Create an aggregator
    pub fn new(
        log: Arc<dyn PartitionedLog>,
        commands: Arc<CommandStore>,
        control: Control,
        poll_interval: Duration,
        max_poll_records: usize,
    ) -> Self {
        Self {
            log,
            commands,
            control,
            poll_interval,
            max_poll_records: max_poll_records.max(1),
        }
    }

    /// Merge status messages until shutdown
    pub fn run(self) {
        let Some(mut consumer) = join_group(
            &self.log,
            STATUS_TOPIC,
            AGGREGATOR_GROUP,
            &[0],
            &self.control,
            self.poll_interval,
        ) else {
            return;
        };
        info!("Status aggregator started");

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
                    error!(error = %e, "Status aggregation failed");
                    if self.control.wait(self.poll_interval) {
                        break;
                    }
                }
            }
        }

        info!("Status aggregator stopped");
    }

    /// Merge available messages, returns how many were committed
    pub fn poll_once(&self, consumer: &mut LogConsumer) -> Result<usize> {
        let mut merged = 0;
        for record in consumer.poll(self.max_poll_records)? {
            match record.decode::<StatusMessage>() {
                Ok(message) => {
                    let outcome = self.commands.merge(&message)?;
                    report(&message, outcome);
                }
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "Skipping undecodable status message");
                }
            }
            consumer.commit(&record)?;
            merged += 1;
        }
        Ok(merged)
    }
}

fn report(message: &StatusMessage, outcome: MergeOutcome) {
    let command_id = message.command_id();
    match outcome {
        MergeOutcome::Applied(BulkState::Completed) => {
            info!(command_id, "Bulk command completed");
        }
        MergeOutcome::Applied(BulkState::Aborted) => {
            info!(command_id, "Bulk command aborted");
        }
        MergeOutcome::Applied(state) => {
            debug!(command_id, %state, "Status merged");
        }
        MergeOutcome::Duplicate => {
            debug!(command_id, "Duplicate bucket delta ignored");
        }
        MergeOutcome::Ignored(state) => {
            debug!(command_id, %state, "Message ignored by terminal status");
        }
        MergeOutcome::UnknownCommand => {
            warn!(command_id, "Status message for unknown command");
        }
    }
}
