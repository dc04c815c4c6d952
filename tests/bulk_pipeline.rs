//! End-to-end tests of the bulk pipeline: submit, scroll, process, aggregate

mod common;

use bulk_engine::action::{ActionHandler, ActionRegistry, NoopAction};
use bulk_engine::bulk::{BulkCommand, BulkService, BulkState, Parameters};
use bulk_engine::engine::Engine;
use bulk_engine::error::{
    ActionResult, BulkError, ProcessorError, SelectionError, SelectionResult,
};
use bulk_engine::log::{consumer_lag, PartitionedLog, SqliteLog, BUCKET_TOPIC, WORKER_GROUP};
use bulk_engine::processor::BulkProcessor;
use bulk_engine::selection::{Cursor, SelectionEngine};
use bulk_engine::store::CommandStore;
use common::{engine_with, seed, test_config, wait_until, CountingAction, WAIT};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_static_dataset_is_fully_processed() {
    let counting = CountingAction::default();
    let engine = engine_with(test_config(3), counting.clone());
    seed(engine.repository(), 57);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(
            BulkCommand::builder("count", "type = 'File'")
                .user("alice")
                .bucket_size(5)
                .batch_size(10)
                .build(),
        )
        .unwrap();

    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());
    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.total, 57);
    assert_eq!(status.processed, 57);
    assert_eq!(status.error_count, 0);
    assert_eq!(status.bucket_count, Some(12));
    assert_eq!(status.buckets_done, 12);
    assert!(status.completed_at.is_some());

    assert_eq!(counting.total(), 57);
    assert_eq!(counting.max_per_record(), 1);
    assert!(engine.processor().stop(Duration::from_secs(5)));
}

#[test]
fn test_set_properties_updates_documents() {
    let engine = engine_with(test_config(2), CountingAction::default());
    seed(engine.repository(), 10);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(
            BulkCommand::builder("setProperties", "*")
                .param("status", "archived")
                .bucket_size(3)
                .build(),
        )
        .unwrap();
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let doc = engine.repository().get("doc-004").unwrap().unwrap();
    assert_eq!(doc.properties.get("status").map(String::as_str), Some("archived"));
    assert!(!doc.properties.contains_key("migrationId"));
}

#[test]
fn test_record_failures_and_panics_are_counted() {
    let engine = engine_with(test_config(2), CountingAction::default());
    seed(engine.repository(), 20);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("flaky", "*").bucket_size(4).build())
        .unwrap();
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.processed, 20);
    assert_eq!(status.error_count, 2);
    assert!(status.error_message.is_some());
    assert!(!status.is_clean_completion());

    // The processor survives a panicking action
    let next = engine
        .bulk()
        .submit(BulkCommand::builder("noop", "*").build())
        .unwrap();
    assert!(engine.bulk().await_completion(&next, WAIT).unwrap());
}

#[test]
fn test_empty_result_completes() {
    let engine = engine_with(test_config(2), CountingAction::default());
    seed(engine.repository(), 5);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("noop", "type = 'Folder'").build())
        .unwrap();
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.total, 0);
    assert_eq!(status.processed, 0);
    assert_eq!(status.bucket_count, Some(0));
}

#[test]
fn test_invalid_commands_are_rejected() {
    let engine = engine_with(test_config(1), CountingAction::default());
    let err = engine
        .bulk()
        .submit(BulkCommand::builder("explode", "*").user("mallory").build())
        .unwrap_err();
    assert!(matches!(err, BulkError::InvalidCommand(_)));
    assert!(engine.bulk().get_statuses("mallory").unwrap().is_empty());
}

#[test]
fn test_unparsable_query_aborts() {
    let engine = engine_with(test_config(1), CountingAction::default());
    engine.processor().start().unwrap();

    // Query syntax belongs to the selection engine, so it fails at scroll time
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("noop", "title = 'unterminated").build())
        .unwrap();
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Aborted);
    assert!(status.error_message.is_some());
}

#[test]
fn test_stop_and_restart_counts_once() {
    let counting = CountingAction::with_delay(Duration::from_millis(2));
    let engine = engine_with(test_config(2), counting.clone());
    seed(engine.repository(), 120);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("count", "*").bucket_size(5).build())
        .unwrap();

    assert!(wait_until(WAIT, || {
        engine.bulk().get_status(&id).unwrap().processed > 0
    }));
    assert!(engine.processor().stop(Duration::from_secs(10)));
    assert!(!engine.processor().is_running());

    let paused = engine.bulk().get_status(&id).unwrap();
    assert!(paused.processed <= 120);

    engine.processor().start().unwrap();
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.processed, 120);
    assert_eq!(status.total, 120);

    // A clean stop never re-applies a committed bucket
    assert_eq!(counting.total(), 120);
    assert_eq!(counting.max_per_record(), 1);
}

#[test]
fn test_abandoned_bucket_is_redelivered() {
    let counting = CountingAction::with_delay(Duration::from_millis(20));
    let engine = engine_with(test_config(1), counting.clone());
    seed(engine.repository(), 40);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("count", "*").bucket_size(10).build())
        .unwrap();

    // Each bucket takes about 200ms, far longer than the grace period
    assert!(wait_until(WAIT, || counting.total() > 0));
    assert!(!engine.processor().stop(Duration::from_millis(1)));
    assert!(!engine.processor().is_running());

    let paused = engine.bulk().get_status(&id).unwrap();
    assert!(paused.processed < 40);
    assert!(!paused.is_terminal());

    // A consumer still finishing its current record can delay the start
    assert!(wait_until(WAIT, || engine.processor().start().is_ok()));
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.processed, 40);
    assert_eq!(status.buckets_done, 4);
    assert_eq!(status.error_count, 0);
    // Only the abandoned bucket can have been applied twice
    assert!(counting.max_per_record() <= 2);
    assert!(counting.total() <= 40 + 10);
}

/// Blocks inside every record until the test releases it
struct GateAction {
    entered: Sender<String>,
    release: Receiver<()>,
}

impl ActionHandler for GateAction {
    fn apply(&self, record_id: &str, _parameters: &Parameters) -> ActionResult<()> {
        let _ = self.entered.send(record_id.to_string());
        let _ = self.release.recv();
        Ok(())
    }
}

#[test]
fn test_start_refused_while_consumer_is_stuck() {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let engine = Engine::open_with_actions(test_config(1), move |repo| {
        ActionRegistry::with_builtins(repo).with(
            "gate",
            GateAction {
                entered: entered_tx,
                release: release_rx,
            },
        )
    })
    .unwrap();
    seed(engine.repository(), 3);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("gate", "*").bucket_size(1).build())
        .unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    assert!(!engine.processor().stop(Duration::from_millis(20)));
    assert!(matches!(
        engine.processor().start(),
        Err(BulkError::Processor(ProcessorError::StillStopping { .. }))
    ));
    assert!(!engine.processor().is_running());

    // Released, the stuck worker drops its bucket and exits
    drop(release_tx);
    assert!(wait_until(WAIT, || engine.processor().start().is_ok()));
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());

    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.processed, 3);
}

#[test]
fn test_restart_with_more_workers_rebalances() {
    let counting = CountingAction::with_delay(Duration::from_millis(1));
    let engine = engine_with(test_config(1), counting.clone());
    seed(engine.repository(), 80);

    engine.processor().start().unwrap();
    let id = engine
        .bulk()
        .submit(BulkCommand::builder("count", "*").bucket_size(4).build())
        .unwrap();
    assert!(wait_until(WAIT, || {
        engine.bulk().get_status(&id).unwrap().processed > 0
    }));

    engine.processor().set_workers(4);
    assert!(engine.processor().restart().unwrap());
    assert_eq!(engine.processor().workers(), 4);

    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());
    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.processed, 80);
    assert_eq!(status.state, BulkState::Completed);
    // Offsets are committed right after each delta is published
    assert!(wait_until(WAIT, || {
        consumer_lag(engine.log().as_ref(), BUCKET_TOPIC, WORKER_GROUP).unwrap() == 0
    }));
}

#[test]
fn test_durable_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bulk.db");
    let config = test_config(2).with_database(path.clone());

    let id = {
        let engine = engine_with(config.clone(), CountingAction::default());
        seed(engine.repository(), 30);
        engine
            .bulk()
            .submit(BulkCommand::builder("noop", "*").user("bob").bucket_size(7).build())
            .unwrap()
    };

    let engine = engine_with(config, CountingAction::default());
    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Scheduled);
    assert_eq!(engine.bulk().get_command(&id).unwrap().username, "bob");

    engine.processor().start().unwrap();
    assert!(engine.bulk().await_completion(&id, WAIT).unwrap());
    let status = engine.bulk().get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Completed);
    assert_eq!(status.processed, 30);
}

/// Selection engine whose backend fails after `pages` pages
struct BrokenSelection {
    pages: usize,
}

struct BrokenCursor {
    left: usize,
    next: usize,
}

impl Cursor for BrokenCursor {
    fn next_page(&mut self) -> SelectionResult<Option<Vec<String>>> {
        if self.left == 0 {
            return Err(SelectionError::Backend("index unavailable".into()));
        }
        self.left -= 1;
        let page = (self.next..self.next + 3).map(|i| format!("r{}", i)).collect();
        self.next += 3;
        Ok(Some(page))
    }
}

impl SelectionEngine for BrokenSelection {
    fn scroll(&self, _query: &str, _page_size: usize) -> SelectionResult<Box<dyn Cursor>> {
        Ok(Box::new(BrokenCursor {
            left: self.pages,
            next: 0,
        }))
    }

    fn count(&self, _query: &str) -> SelectionResult<Option<u64>> {
        Ok(None)
    }
}

#[test]
fn test_selection_failure_aborts() {
    let log: Arc<dyn PartitionedLog> = Arc::new(SqliteLog::open_in_memory().unwrap());
    let commands = Arc::new(CommandStore::open_in_memory().unwrap());
    let actions = Arc::new(ActionRegistry::new().with("noop", NoopAction));
    let config = test_config(2);
    let bulk = BulkService::new(
        commands.clone(),
        log.clone(),
        actions.clone(),
        config.poll_interval,
    );
    let processor = BulkProcessor::new(
        log,
        commands,
        Arc::new(BrokenSelection { pages: 2 }),
        actions,
        config,
    );

    processor.start().unwrap();
    let id = bulk
        .submit(BulkCommand::builder("noop", "*").bucket_size(2).build())
        .unwrap();
    assert!(bulk.await_completion(&id, WAIT).unwrap());

    let status = bulk.get_status(&id).unwrap();
    assert_eq!(status.state, BulkState::Aborted);
    assert!(status
        .error_message
        .as_deref()
        .unwrap()
        .contains("index unavailable"));

    // Buckets published before the failure may still be counted, the state stays
    std::thread::sleep(Duration::from_millis(50));
    let later = bulk.get_status(&id).unwrap();
    assert_eq!(later.state, BulkState::Aborted);
    assert!(later.processed <= 6);
    assert!(processor.stop(Duration::from_secs(5)));
}
