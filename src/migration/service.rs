//! Migration state machine on top of bulk commands
//!
//! A step is guarded by the persisted `running` flag: [`MigrationStore::try_begin`]
//! takes it, and the step is finalized from the status of its bulk command,
//! either by a watcher thread or lazily on the next read.

use super::descriptor::{MigrationDescriptor, MigrationStep};
use crate::bulk::{BulkService, BulkStatus};
use crate::error::{BulkError, MigrationError, Result};
use crate::selection::SelectionEngine;
use crate::store::{GuardOutcome, MigrationRecord, MigrationStore};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Age after which a running step whose command was never persisted is failed
const ORPHAN_AFTER_SECS: i64 = 60;

/// Answer of [`MigrationService::get_status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatusView {
    pub migration_id: String,
    pub state: String,
    pub running: bool,
    pub has_error: bool,
    pub last_error: Option<String>,
    pub step: Option<String>,
    pub command_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<MigrationRecord> for MigrationStatusView {
    fn from(record: MigrationRecord) -> Self {
        Self {
            has_error: record.last_error.is_some(),
            migration_id: record.migration_id,
            state: record.state,
            running: record.running,
            last_error: record.last_error,
            step: record.step,
            command_id: record.command_id,
            updated_at: record.updated_at,
        }
    }
}

/// Probes, runs and tracks migrations
pub struct MigrationService {
    descriptors: BTreeMap<String, MigrationDescriptor>,
    store: Arc<MigrationStore>,
    bulk: Arc<BulkService>,
    selection: Arc<dyn SelectionEngine>,
    poll_interval: Duration,
    watch_stop: Mutex<Option<Sender<()>>>,
    watch_signal: Receiver<()>,
}

impl MigrationService {
    /// Create a service over validated descriptors
    pub fn new(
        descriptors: BTreeMap<String, MigrationDescriptor>,
        store: Arc<MigrationStore>,
        bulk: Arc<BulkService>,
        selection: Arc<dyn SelectionEngine>,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = bounded(0);
        Self {
            descriptors,
            store,
            bulk,
            selection,
            poll_interval,
            watch_stop: Mutex::new(Some(tx)),
            watch_signal: rx,
        }
    }

    /// Registered migration ids
    pub fn migration_ids(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    /// A registered descriptor
    pub fn descriptor(&self, migration_id: &str) -> Option<&MigrationDescriptor> {
        self.descriptors.get(migration_id)
    }

    /// Infer the current state from the data and persist it
    ///
    /// While a step is running the persisted state is left alone and the
    /// inferred state is only returned.
    pub fn probe_and_set_state(&self, migration_id: &str) -> Result<String> {
        let descriptor = self
            .descriptors
            .get(migration_id)
            .ok_or_else(|| MigrationError::UnknownMigration(migration_id.to_string()))?;

        let state = self.probe(descriptor)?;
        let record = self.store.record_probed_state(migration_id, &state)?;
        if record.running {
            debug!(
                migration_id,
                probed = %state,
                persisted = %record.state,
                "Probe while a step is running, state kept"
            );
        } else {
            info!(migration_id, %state, "Migration state probed");
        }
        Ok(state)
    }

    fn probe(&self, descriptor: &MigrationDescriptor) -> Result<String> {
        for state in &descriptor.states {
            let Some(probe) = &state.probe else {
                continue;
            };
            if self.selection.exists(probe)? {
                return Ok(state.name.clone());
            }
        }
        descriptor
            .fallback_state()
            .map(str::to_string)
            .ok_or_else(|| {
                MigrationError::IllegalState(format!(
                    "no state of migration '{}' matches the data",
                    descriptor.id
                ))
                .into()
            })
    }

    /// Start `step_name`; returns the id of its bulk command immediately
    pub fn run_step(&self, migration_id: &str, step_name: &str) -> Result<String> {
        let descriptor = self.descriptors.get(migration_id).ok_or_else(|| {
            MigrationError::IllegalArgument(format!("unknown migration '{}'", migration_id))
        })?;
        let step = descriptor.step(step_name).ok_or_else(|| {
            MigrationError::IllegalArgument(format!(
                "unknown step '{}' for migration '{}'",
                step_name, migration_id
            ))
        })?;

        match self.store.get(migration_id)? {
            None => {
                self.probe_and_set_state(migration_id)?;
            }
            Some(record) => {
                self.reconcile(record)?;
            }
        }

        let command = step.to_command(migration_id);
        let command_id = command.id.clone();
        match self
            .store
            .try_begin(migration_id, step_name, &step.from_state, &command_id)?
        {
            GuardOutcome::Acquired => {}
            GuardOutcome::Running { step } => {
                return Err(MigrationError::ConcurrencyConflict {
                    migration_id: migration_id.to_string(),
                    step: step.unwrap_or_default(),
                }
                .into());
            }
            GuardOutcome::StateMismatch { actual } => {
                return Err(MigrationError::IllegalState(format!(
                    "step '{}' runs from state '{}' but migration '{}' is in state '{}'",
                    step_name, step.from_state, migration_id, actual
                ))
                .into());
            }
            GuardOutcome::Missing => {
                return Err(MigrationError::IllegalState(format!(
                    "migration '{}' has no persisted state",
                    migration_id
                ))
                .into());
            }
        }

        if let Err(e) = self.bulk.submit(command) {
            error!(migration_id, step = step_name, error = %e, "Failed to submit migration step");
            self.store.finalize(
                migration_id,
                &command_id,
                None,
                Some(&format!("Failed to submit step '{}': {}", step_name, e)),
            )?;
            return Err(e);
        }

        info!(migration_id, step = step_name, command_id = %command_id, "Migration step started");
        self.spawn_watcher(migration_id, &command_id, step)?;
        Ok(command_id)
    }

    /// Probe, then run the first step leaving the probed state
    pub fn probe_and_run(&self, migration_id: &str) -> Result<String> {
        let state = self.probe_and_set_state(migration_id)?;
        let step = self
            .descriptors
            .get(migration_id)
            .and_then(|d| d.first_step_from(&state))
            .ok_or_else(|| {
                MigrationError::IllegalState(format!(
                    "migration '{}' has no step from state '{}'",
                    migration_id, state
                ))
            })?;
        let step_name = step.name.clone();
        self.run_step(migration_id, &step_name)
    }

    /// Persisted status, finalizing a step whose command already ended
    pub fn get_status(&self, migration_id: &str) -> Result<MigrationStatusView> {
        if !self.descriptors.contains_key(migration_id) {
            return Err(MigrationError::UnknownMigration(migration_id.to_string()).into());
        }
        let record = match self.store.get(migration_id)? {
            Some(record) => self.reconcile(record)?,
            None => {
                self.probe_and_set_state(migration_id)?;
                self.store.get(migration_id)?.ok_or_else(|| {
                    MigrationError::UnknownMigration(migration_id.to_string())
                })?
            }
        };
        Ok(record.into())
    }

    /// Spawn watchers for every step left running by a previous process
    pub fn resume_watchers(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self.store.list()? {
            if !record.running {
                continue;
            }
            let (Some(step_name), Some(command_id)) = (&record.step, &record.command_id) else {
                continue;
            };
            let Some(step) = self
                .descriptors
                .get(&record.migration_id)
                .and_then(|d| d.step(step_name))
            else {
                warn!(migration_id = %record.migration_id, step = %step_name, "Running step is no longer declared");
                continue;
            };
            self.spawn_watcher(&record.migration_id, command_id, step)?;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Stop every watcher thread; running steps are finalized lazily later
    pub fn shutdown(&self) {
        self.watch_stop.lock().take();
    }

    fn reconcile(&self, record: MigrationRecord) -> Result<MigrationRecord> {
        if !record.running {
            return Ok(record);
        }
        let Some(command_id) = record.command_id.clone() else {
            return Ok(record);
        };

        let finalized = match self.bulk.get_status(&command_id) {
            Ok(status) if status.is_terminal() => {
                let to_state = record
                    .step
                    .as_deref()
                    .and_then(|s| self.descriptors.get(&record.migration_id)?.step(s))
                    .map(|s| s.to_state.clone());
                finalize_step(&self.store, &record.migration_id, &command_id, to_state.as_deref(), &status)?
            }
            Ok(_) => false,
            Err(BulkError::NotFound(_)) => {
                let age = Utc::now().signed_duration_since(record.updated_at);
                if age.num_seconds() < ORPHAN_AFTER_SECS {
                    false
                } else {
                    warn!(migration_id = %record.migration_id, command_id = %command_id, "Step command was never persisted");
                    self.store.finalize(
                        &record.migration_id,
                        &command_id,
                        None,
                        Some(&format!("Bulk command {} doesn't exist", command_id)),
                    )?
                }
            }
            Err(e) => return Err(e),
        };

        if !finalized {
            return Ok(record);
        }
        Ok(self.store.get(&record.migration_id)?.unwrap_or(record))
    }

    fn spawn_watcher(&self, migration_id: &str, command_id: &str, step: &MigrationStep) -> Result<()> {
        let store = self.store.clone();
        let bulk = self.bulk.clone();
        let signal = self.watch_signal.clone();
        let poll_interval = self.poll_interval;
        let migration_id = migration_id.to_string();
        let command_id = command_id.to_string();
        let to_state = step.to_state.clone();

        thread::Builder::new()
            .name(format!("migration-watch-{}", migration_id))
            .spawn(move || loop {
                match bulk.get_status(&command_id) {
                    Ok(status) if status.is_terminal() => {
                        if let Err(e) =
                            finalize_step(&store, &migration_id, &command_id, Some(&to_state), &status)
                        {
                            error!(migration_id = %migration_id, error = %e, "Failed to finalize migration step");
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(migration_id = %migration_id, error = %e, "Watcher status read failed");
                    }
                }
                if matches!(
                    signal.recv_timeout(poll_interval),
                    Err(RecvTimeoutError::Disconnected)
                ) {
                    break;
                }
            })?;
        Ok(())
    }
}

impl Drop for MigrationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Finalize a step from the terminal status of its command
///
/// Only a clean completion moves the migration to `to_state`.
fn finalize_step(
    store: &MigrationStore,
    migration_id: &str,
    command_id: &str,
    to_state: Option<&str>,
    status: &BulkStatus,
) -> Result<bool> {
    let (new_state, last_error) = match to_state {
        Some(to) if status.is_clean_completion() => (Some(to), None),
        Some(_) => (None, Some(step_error(status))),
        None => (None, Some("Step is no longer declared".to_string())),
    };

    let finalized = store.finalize(migration_id, command_id, new_state, last_error.as_deref())?;
    if finalized {
        match new_state {
            Some(state) => info!(migration_id, command_id, %state, "Migration step completed"),
            None => warn!(
                migration_id,
                command_id,
                error = last_error.as_deref().unwrap_or_default(),
                "Migration step failed"
            ),
        }
    }
    Ok(finalized)
}

fn step_error(status: &BulkStatus) -> String {
    match &status.error_message {
        Some(message) => message.clone(),
        None if status.error_count > 0 => format!("{} records failed", status.error_count),
        None => format!("Bulk command ended {}", status.state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::bulk::{BulkState, StatusDelta, StatusMessage};
    use crate::log::SqliteLog;
    use crate::migration::parse_descriptors;
    use crate::selection::{Document, SqliteRepository};
    use crate::store::CommandStore;

    const MIGRATIONS: &str = r#"[{
        "id": "titles",
        "states": [
            { "name": "before", "probe": "title = 'Content to migrate'" },
            { "name": "after" }
        ],
        "steps": [{
            "name": "before-to-after",
            "fromState": "before",
            "toState": "after",
            "command": {
                "action": "setProperties",
                "query": "title = 'Content to migrate'",
                "parameters": { "title": "Content migrated" }
            }
        }]
    }]"#;

    struct Fixture {
        service: MigrationService,
        commands: Arc<CommandStore>,
        store: Arc<MigrationStore>,
    }

    fn fixture() -> Fixture {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.save(&Document::new("doc-1", "File", "Content to migrate"))
            .unwrap();
        let commands = Arc::new(CommandStore::open_in_memory().unwrap());
        let store = Arc::new(MigrationStore::open_in_memory().unwrap());
        let bulk = Arc::new(BulkService::new(
            commands.clone(),
            Arc::new(SqliteLog::open_in_memory().unwrap()),
            Arc::new(ActionRegistry::with_builtins(repo.clone())),
            Duration::from_millis(5),
        ));
        let service = MigrationService::new(
            parse_descriptors(MIGRATIONS).unwrap(),
            store.clone(),
            bulk,
            Arc::new(repo),
            Duration::from_millis(5),
        );
        Fixture {
            service,
            commands,
            store,
        }
    }

    fn complete(commands: &CommandStore, command_id: &str, errors: u64) {
        commands
            .merge(&StatusMessage::Processed(StatusDelta {
                command_id: command_id.into(),
                partition: 0,
                sequence: 0,
                processed: 1,
                errors,
                error_message: (errors > 0).then(|| "rejected".to_string()),
            }))
            .unwrap();
        commands
            .merge(&StatusMessage::ScrollCompleted {
                command_id: command_id.into(),
                total: 1,
                bucket_count: 1,
            })
            .unwrap();
    }

    #[test]
    fn test_probe() {
        let f = fixture();
        assert_eq!(f.service.probe_and_set_state("titles").unwrap(), "before");
        assert_eq!(f.store.get("titles").unwrap().unwrap().state, "before");
        assert!(matches!(
            f.service.probe_and_set_state("nope"),
            Err(BulkError::Migration(MigrationError::UnknownMigration(_)))
        ));
    }

    #[test]
    fn test_run_step_guards() {
        let f = fixture();
        assert!(matches!(
            f.service.run_step("nope", "before-to-after"),
            Err(BulkError::Migration(MigrationError::IllegalArgument(_)))
        ));
        assert!(matches!(
            f.service.run_step("titles", "sideways"),
            Err(BulkError::Migration(MigrationError::IllegalArgument(_)))
        ));

        let command_id = f.service.run_step("titles", "before-to-after").unwrap();
        let command = f.commands.get_command(&command_id).unwrap().unwrap();
        assert_eq!(command.param("migrationId"), Some("titles"));
        assert_eq!(command.param("stepName"), Some("before-to-after"));

        assert!(matches!(
            f.service.run_step("titles", "before-to-after"),
            Err(BulkError::Migration(MigrationError::ConcurrencyConflict { .. }))
        ));

        let view = f.service.get_status("titles").unwrap();
        assert!(view.running);
        assert_eq!(view.command_id.as_deref(), Some(command_id.as_str()));
    }

    #[test]
    fn test_lazy_reconcile_clean_completion() {
        let f = fixture();
        f.service.shutdown();
        let command_id = f.service.run_step("titles", "before-to-after").unwrap();
        complete(&f.commands, &command_id, 0);

        let view = f.service.get_status("titles").unwrap();
        assert!(!view.running);
        assert!(!view.has_error);
        assert_eq!(view.state, "after");

        assert!(matches!(
            f.service.run_step("titles", "before-to-after"),
            Err(BulkError::Migration(MigrationError::IllegalState(_)))
        ));
    }

    #[test]
    fn test_failed_step_keeps_state() {
        let f = fixture();
        f.service.shutdown();
        let command_id = f.service.probe_and_run("titles").unwrap();
        complete(&f.commands, &command_id, 1);

        let view = f.service.get_status("titles").unwrap();
        assert!(!view.running);
        assert!(view.has_error);
        assert_eq!(view.state, "before");
        assert_eq!(view.last_error.as_deref(), Some("rejected"));
    }

    #[test]
    fn test_watcher_finalizes() {
        let f = fixture();
        let command_id = f.service.run_step("titles", "before-to-after").unwrap();
        f.commands
            .merge(&StatusMessage::ScrollFailed {
                command_id: command_id.clone(),
                message: "selection down".into(),
            })
            .unwrap();
        assert_eq!(
            f.commands.get_status(&command_id).unwrap().unwrap().state,
            BulkState::Aborted
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = f.store.get("titles").unwrap().unwrap();
            if !record.running {
                assert_eq!(record.last_error.as_deref(), Some("selection down"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "watcher never finalized");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_step_error_fallbacks() {
        let mut status = BulkStatus::scheduled("c", "noop", "system", Utc::now());
        status.state = BulkState::Completed;
        status.error_count = 3;
        assert_eq!(step_error(&status), "3 records failed");

        status.error_count = 0;
        status.state = BulkState::Aborted;
        assert_eq!(step_error(&status), "Bulk command ended ABORTED");
    }
}
