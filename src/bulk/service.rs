//! Public bulk API: submit, status, await, listing

use crate::action::ActionRegistry;
use crate::bulk::{BulkCommand, BulkState, BulkStatus, StatusMessage};
use crate::config::validate_size;
use crate::error::{BulkError, LogResult, Result};
use crate::log::{publish_json, PartitionedLog, COMMAND_TOPIC};
use crate::store::CommandStore;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Point in time a wait gives up at
///
/// A timeout too large to add to the current instant never expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Time left, `Duration::MAX` without a deadline
    pub fn remaining(&self) -> Duration {
        match self.0 {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Entry point for submitting and tracking bulk commands
pub struct BulkService {
    commands: Arc<CommandStore>,
    log: Arc<dyn PartitionedLog>,
    actions: Arc<ActionRegistry>,
    poll_interval: Duration,
}

impl BulkService {
    /// Create a service
    pub fn new(
        commands: Arc<CommandStore>,
        log: Arc<dyn PartitionedLog>,
        actions: Arc<ActionRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            commands,
            log,
            actions,
            poll_interval,
        }
    }

    /// Validate, persist and publish a command; returns its id immediately
    ///
    /// Invalid commands are rejected before anything is persisted. If the
    /// command cannot be published it is marked ABORTED and the error returned.
    pub fn submit(&self, command: BulkCommand) -> Result<String> {
        self.validate(&command)?;
        self.commands.insert(&command)?;

        if let Err(e) = self.publish(&command) {
            error!(command_id = %command.id, error = %e, "Failed to publish command");
            self.commands.merge(&StatusMessage::ScrollFailed {
                command_id: command.id.clone(),
                message: format!("Failed to publish command: {}", e),
            })?;
            return Err(e.into());
        }

        info!(
            command_id = %command.id,
            action = %command.action,
            username = %command.username,
            "Bulk command submitted"
        );
        Ok(command.id)
    }

    fn validate(&self, command: &BulkCommand) -> Result<()> {
        if !self.actions.contains(&command.action) {
            return Err(BulkError::InvalidCommand(format!(
                "unknown action '{}'",
                command.action
            )));
        }
        if command.query.trim().is_empty() {
            return Err(BulkError::InvalidCommand("empty query".to_string()));
        }
        validate_size("bucket size", command.bucket_size)
            .and_then(|_| validate_size("batch size", command.batch_size))
            .map_err(|e| BulkError::InvalidCommand(e.to_string()))?;
        Ok(())
    }

    fn publish(&self, command: &BulkCommand) -> LogResult<u64> {
        self.log.create_topic(COMMAND_TOPIC, 1)?;
        publish_json(self.log.as_ref(), COMMAND_TOPIC, 0, command)
    }

    /// Current status of a command
    pub fn get_status(&self, id: &str) -> Result<BulkStatus> {
        self.commands
            .get_status(id)?
            .ok_or_else(|| BulkError::NotFound(id.to_string()))
    }

    /// Wait until the command is COMPLETED or ABORTED
    ///
    /// Returns false if `timeout` elapses first. Never cancels the command.
    pub fn await_completion(&self, id: &str, timeout: Duration) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        loop {
            if self.get_status(id)?.is_terminal() {
                return Ok(true);
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Ok(false);
            }
            thread::sleep(self.poll_interval.min(remaining));
        }
    }

    /// Statuses of a user's commands, newest first
    pub fn get_statuses(&self, username: &str) -> Result<Vec<BulkStatus>> {
        Ok(self.commands.statuses_for_user(username)?)
    }

    /// Number of commands in each state
    pub fn count_by_state(&self) -> Result<Vec<(BulkState, u64)>> {
        Ok(self.commands.count_by_state()?)
    }

    /// A submitted command
    pub fn get_command(&self, id: &str) -> Result<BulkCommand> {
        self.commands
            .get_command(id)?
            .ok_or_else(|| BulkError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NoopAction;
    use crate::error::LogError;
    use crate::log::{LogRecord, SqliteLog};

    fn service_with_log(log: Arc<dyn PartitionedLog>) -> (BulkService, Arc<CommandStore>) {
        let commands = Arc::new(CommandStore::open_in_memory().unwrap());
        let actions = Arc::new(ActionRegistry::new().with("noop", NoopAction));
        let service = BulkService::new(
            commands.clone(),
            log,
            actions,
            Duration::from_millis(5),
        );
        (service, commands)
    }

    fn service() -> (BulkService, Arc<CommandStore>) {
        service_with_log(Arc::new(SqliteLog::open_in_memory().unwrap()))
    }

    #[test]
    fn test_submit_persists_and_publishes() {
        let (service, _) = service();
        let id = service
            .submit(BulkCommand::builder("noop", "*").user("alice").build())
            .unwrap();

        assert_eq!(service.get_status(&id).unwrap().state, BulkState::Scheduled);
        assert_eq!(service.get_command(&id).unwrap().username, "alice");
        assert_eq!(service.get_statuses("alice").unwrap().len(), 1);
        assert_eq!(service.log.end_offset(COMMAND_TOPIC, 0).unwrap(), 1);
    }

    #[test]
    fn test_invalid_commands_are_not_persisted() {
        let (service, _) = service();
        let invalid = [
            BulkCommand::builder("missing", "*").user("bob").build(),
            BulkCommand::builder("noop", "  ").user("bob").build(),
            BulkCommand::builder("noop", "*").user("bob").bucket_size(0).build(),
            BulkCommand::builder("noop", "*").user("bob").batch_size(0).build(),
        ];
        for command in invalid {
            assert!(matches!(
                service.submit(command),
                Err(BulkError::InvalidCommand(_))
            ));
        }
        assert!(service.get_statuses("bob").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_ids() {
        let (service, _) = service();
        let err = service.get_status("nope").unwrap_err();
        assert_eq!(err.to_string(), "Bulk command with id=nope doesn't exist");
        assert!(service.get_command("nope").unwrap_err().is_not_found());
        assert!(service
            .await_completion("nope", Duration::from_millis(10))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_await_times_out_without_processor() {
        let (service, _) = service();
        let id = service.submit(BulkCommand::builder("noop", "*").build()).unwrap();

        let start = Instant::now();
        assert!(!service.await_completion(&id, Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(service.get_status(&id).unwrap().state, BulkState::Scheduled);
    }

    #[test]
    fn test_await_without_deadline() {
        let (service, commands) = service();
        let id = service.submit(BulkCommand::builder("noop", "*").build()).unwrap();

        let finisher = {
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                commands
                    .merge(&StatusMessage::ScrollCompleted {
                        command_id: id,
                        total: 0,
                        bucket_count: 0,
                    })
                    .unwrap();
            })
        };
        assert!(service.await_completion(&id, Duration::MAX).unwrap());
        finisher.join().unwrap();
        assert_eq!(service.get_status(&id).unwrap().state, BulkState::Completed);
    }

    #[test]
    fn test_deadline() {
        assert_eq!(Deadline::after(Duration::MAX).remaining(), Duration::MAX);
        assert!(!Deadline::after(Duration::from_secs(u64::MAX)).is_expired());
        assert!(Deadline::after(Duration::ZERO).is_expired());
        assert!(Deadline::after(Duration::from_secs(60)).remaining() <= Duration::from_secs(60));
    }

    struct ReadOnlyLog;

    impl PartitionedLog for ReadOnlyLog {
        fn create_topic(&self, _topic: &str, _partitions: u32) -> LogResult<()> {
            Ok(())
        }
        fn partitions(&self, _topic: &str) -> LogResult<u32> {
            Ok(1)
        }
        fn publish(&self, _topic: &str, _partition: u32, _payload: &str) -> LogResult<u64> {
            Err(LogError::Unavailable("read-only".into()))
        }
        fn read(&self, _: &str, _: u32, _: u64, _: usize) -> LogResult<Vec<LogRecord>> {
            Ok(Vec::new())
        }
        fn end_offset(&self, _topic: &str, _partition: u32) -> LogResult<u64> {
            Ok(0)
        }
        fn committed_offset(&self, _: &str, _: &str, _: u32) -> LogResult<u64> {
            Ok(0)
        }
        fn commit_offset(&self, _: &str, _: &str, _: u32, _: u64) -> LogResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_publish_failure_aborts() {
        let (service, commands) = service_with_log(Arc::new(ReadOnlyLog));
        let command = BulkCommand::builder("noop", "*").build();
        let id = command.id.clone();

        assert!(matches!(service.submit(command), Err(BulkError::Log(_))));
        let status = commands.get_status(&id).unwrap().unwrap();
        assert_eq!(status.state, BulkState::Aborted);
        assert!(status.error_message.unwrap().contains("read-only"));
    }
}
