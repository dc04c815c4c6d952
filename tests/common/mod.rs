//! Shared helpers for integration tests

#![allow(dead_code)]

use bulk_engine::action::{ActionHandler, ActionRegistry};
use bulk_engine::bulk::Parameters;
use bulk_engine::config::EngineConfig;
use bulk_engine::engine::Engine;
use bulk_engine::error::{ActionError, ActionResult};
use bulk_engine::selection::{Document, SqliteRepository};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(30);

/// Fast-polling in-memory configuration
pub fn test_config(workers: usize) -> EngineConfig {
    EngineConfig::in_memory()
        .with_workers(workers)
        .with_partitions(4)
        .with_poll_interval(Duration::from_millis(5))
}

/// `count` File documents with ids doc-000, doc-001, ...
pub fn seed(repo: &SqliteRepository, count: usize) -> Vec<String> {
    let docs: Vec<Document> = (0..count)
        .map(|i| Document::new(&format!("doc-{:03}", i), "File", &format!("Document {}", i)))
        .collect();
    repo.save_all(&docs).unwrap();
    docs.into_iter().map(|d| d.id).collect()
}

/// Records how often each record was applied, optionally slowly
#[derive(Clone, Default)]
pub struct CountingAction {
    pub applied: Arc<Mutex<HashMap<String, u32>>>,
    pub delay: Duration,
}

impl CountingAction {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.applied.lock().values().map(|&n| n as usize).sum()
    }

    pub fn max_per_record(&self) -> u32 {
        self.applied.lock().values().copied().max().unwrap_or(0)
    }
}

impl ActionHandler for CountingAction {
    fn apply(&self, record_id: &str, _parameters: &Parameters) -> ActionResult<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        *self.applied.lock().entry(record_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Fails on doc-003 and panics on doc-007
pub struct FlakyAction;

impl ActionHandler for FlakyAction {
    fn apply(&self, record_id: &str, _parameters: &Parameters) -> ActionResult<()> {
        match record_id {
            "doc-003" => Err(ActionError::Failed {
                record_id: record_id.to_string(),
                reason: "checksum mismatch".to_string(),
            }),
            "doc-007" => panic!("corrupt record {}", record_id),
            _ => Ok(()),
        }
    }
}

/// Engine with the built-in actions plus `count` and `flaky`
pub fn engine_with(config: EngineConfig, counting: CountingAction) -> Engine {
    Engine::open_with_actions(config, move |repo| {
        ActionRegistry::with_builtins(repo)
            .with("count", counting)
            .with("flaky", FlakyAction)
    })
    .unwrap()
}

/// Poll `check` until it holds or `timeout` elapses
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
