//! Bulk processor runtime
//!
//! Runs every consumer of the engine on named OS threads:
//!
//! ```text
//! ┌──────────────┐   buckets    ┌───────────────────┐
//! │ bulk-scroller│ ───────────► │ bulk-worker-0..W  │
//! └──────┬───────┘              └─────────┬─────────┘
//!        │ scroll markers                 │ deltas
//!        ▼                                ▼
//! ┌───────────────────────────────────────────────────┐
//! │          bulk-status ──► bulk-aggregator          │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! Threads share nothing but the log and the store. Stopping drops the
//! shutdown sender: consumers finish their current bucket and exit. After the
//! grace period an abandon flag makes workers drop the current bucket between
//! records without committing it, so it is redelivered on the next start.

mod aggregator;
mod scroller;
mod worker;

pub use aggregator::Aggregator;
pub use scroller::Scroller;
pub use worker::ActionWorker;

use crate::action::ActionRegistry;
use crate::bulk::Deadline;
use crate::config::EngineConfig;
use crate::error::{ProcessorError, Result};
use crate::log::{self, owned_partitions, LogConsumer, PartitionedLog, BUCKET_TOPIC};
use crate::selection::SelectionEngine;
use crate::store::CommandStore;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Stop signals shared by every consumer thread
#[derive(Clone)]
pub struct Control {
    shutdown: Receiver<()>,
    abandon: Arc<AtomicBool>,
}

impl Control {
    /// Sleep up to `timeout`, returns true as soon as shutdown is requested
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.shutdown.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Whether in-flight work must be dropped
    pub fn is_abandoned(&self) -> bool {
        self.abandon.load(Ordering::SeqCst)
    }

    /// Control that never stops, for driving consumers by hand
    pub fn detached() -> (Self, Sender<()>) {
        let (tx, rx) = bounded(0);
        (
            Self {
                shutdown: rx,
                abandon: Arc::new(AtomicBool::new(false)),
            },
            tx,
        )
    }
}

/// Notifies the processor when a consumer thread exits, even by panic
struct ExitGuard {
    name: String,
    done: Sender<String>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.done.send(self.name.clone());
    }
}

/// Threads of one processor run
struct RunningSet {
    shutdown: Sender<()>,
    abandon: Arc<AtomicBool>,
    done: Receiver<String>,
    handles: Vec<JoinHandle<()>>,
}

/// Threads a stop gave up waiting for
struct Detached {
    done: Receiver<String>,
    remaining: usize,
}

impl Detached {
    /// Count exits since the stop, returns how many threads are still alive
    fn reap(&mut self) -> usize {
        while self.remaining > 0 && self.done.try_recv().is_ok() {
            self.remaining -= 1;
        }
        self.remaining
    }
}

/// Starts, stops and restarts the scroller, the worker pool and the aggregator
pub struct BulkProcessor {
    log: Arc<dyn PartitionedLog>,
    commands: Arc<CommandStore>,
    selection: Arc<dyn SelectionEngine>,
    actions: Arc<ActionRegistry>,
    config: EngineConfig,
    workers: AtomicUsize,
    running: Mutex<Option<RunningSet>>,
    detached: Mutex<Option<Detached>>,
}

impl BulkProcessor {
    /// Create a stopped processor
    pub fn new(
        log: Arc<dyn PartitionedLog>,
        commands: Arc<CommandStore>,
        selection: Arc<dyn SelectionEngine>,
        actions: Arc<ActionRegistry>,
        config: EngineConfig,
    ) -> Self {
        let workers = config.workers;
        Self {
            log,
            commands,
            selection,
            actions,
            config,
            workers: AtomicUsize::new(workers),
            running: Mutex::new(None),
            detached: Mutex::new(None),
        }
    }

    /// Change the worker count used by the next start
    pub fn set_workers(&self, workers: usize) {
        self.workers.store(workers.max(1), Ordering::SeqCst);
    }

    /// Current worker count
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Whether consumer threads are running
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn every consumer thread
    ///
    /// Partitions are assigned to workers on every start, so a start with a
    /// different worker count rebalances them. Refused while threads detached
    /// by an earlier stop are alive, since they still consume their partitions.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ProcessorError::AlreadyRunning.into());
        }
        {
            let mut detached = self.detached.lock();
            if let Some(threads) = detached.as_mut().map(Detached::reap) {
                if threads > 0 {
                    error!(threads, "Refusing to start while detached consumers are alive");
                    return Err(ProcessorError::StillStopping { threads }.into());
                }
                *detached = None;
            }
        }

        log::create_engine_topics(self.log.as_ref(), self.config.partitions)?;
        let partitions = self.log.partitions(BUCKET_TOPIC)?;
        let workers = self.workers();

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = unbounded();
        let abandon = Arc::new(AtomicBool::new(false));
        let control = Control {
            shutdown: shutdown_rx,
            abandon: abandon.clone(),
        };

        let mut set = RunningSet {
            shutdown: shutdown_tx,
            abandon,
            done: done_rx,
            handles: Vec::with_capacity(workers + 2),
        };

        let scroller = Scroller::new(
            self.log.clone(),
            self.commands.clone(),
            self.selection.clone(),
            control.clone(),
            self.config.poll_interval,
        );
        self.spawn(&mut set, "bulk-scroller".to_string(), &done_tx, move || {
            scroller.run()
        })?;

        for index in 0..workers {
            let owned = owned_partitions(index, workers, partitions);
            if owned.is_empty() {
                continue;
            }
            let worker = ActionWorker::new(
                index,
                owned,
                self.log.clone(),
                self.commands.clone(),
                self.actions.clone(),
                control.clone(),
                self.config.poll_interval,
                self.config.max_poll_records,
            );
            self.spawn(&mut set, format!("bulk-worker-{}", index), &done_tx, move || {
                worker.run()
            })?;
        }

        let aggregator = Aggregator::new(
            self.log.clone(),
            self.commands.clone(),
            control,
            self.config.poll_interval,
            self.config.max_poll_records,
        );
        self.spawn(&mut set, "bulk-aggregator".to_string(), &done_tx, move || {
            aggregator.run()
        })?;

        info!(
            workers,
            partitions,
            threads = set.handles.len(),
            "Bulk processor started"
        );
        *running = Some(set);
        Ok(())
    }

    fn spawn<F>(
        &self,
        set: &mut RunningSet,
        name: String,
        done: &Sender<String>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = ExitGuard {
            name: name.clone(),
            done: done.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                body();
            })
            .map_err(|e| ProcessorError::SpawnFailed {
                name,
                reason: e.to_string(),
            })?;
        set.handles.push(handle);
        Ok(())
    }

    /// Stop every consumer thread
    ///
    /// Returns true if all threads exited within `grace`. Otherwise in-flight
    /// buckets are abandoned uncommitted and the threads get one more grace
    /// period before they are detached.
    pub fn stop(&self, grace: Duration) -> bool {
        let Some(set) = self.running.lock().take() else {
            return true;
        };
        let RunningSet {
            shutdown,
            abandon,
            done,
            handles,
        } = set;

        drop(shutdown);
        let expected = handles.len();
        let mut exited = wait_for_exits(&done, 0, expected, Deadline::after(grace));
        let clean = exited == expected;

        if !clean {
            warn!(
                remaining = expected - exited,
                "Grace period elapsed, abandoning in-flight buckets"
            );
            abandon.store(true, Ordering::SeqCst);
            exited = wait_for_exits(&done, exited, expected, Deadline::after(grace));
        }

        for handle in handles {
            if handle.is_finished() && handle.join().is_err() {
                warn!("Consumer thread panicked");
            }
        }

        if exited < expected {
            error!(
                detached = expected - exited,
                "Consumer threads did not exit and were detached"
            );
            *self.detached.lock() = Some(Detached {
                done,
                remaining: expected - exited,
            });
        }
        info!(clean, "Bulk processor stopped");
        clean
    }

    /// Stop with the configured grace period, then start again
    ///
    /// Fails with [`ProcessorError::StillStopping`] when the stop had to
    /// detach threads; `start` can be retried once they have exited.
    pub fn restart(&self) -> Result<bool> {
        let clean = self.stop(self.config.stop_grace);
        self.start()?;
        Ok(clean)
    }
}

impl Drop for BulkProcessor {
    fn drop(&mut self) {
        self.stop(self.config.stop_grace);
    }
}

/// Join a consumer group, retrying until it works or shutdown is requested
fn join_group(
    log: &Arc<dyn PartitionedLog>,
    topic: &str,
    group: &str,
    partitions: &[u32],
    control: &Control,
    poll_interval: Duration,
) -> Option<LogConsumer> {
    loop {
        match LogConsumer::assign(log.clone(), topic, group, partitions) {
            Ok(consumer) => return Some(consumer),
            Err(e) => {
                warn!(topic, group, error = %e, "Failed to join consumer group, retrying");
                if control.wait(poll_interval) {
                    return None;
                }
            }
        }
    }
}

fn wait_for_exits(
    done: &Receiver<String>,
    mut exited: usize,
    expected: usize,
    deadline: Deadline,
) -> usize {
    while exited < expected {
        match done.recv_timeout(deadline.remaining()) {
            Ok(_) => exited += 1,
            Err(_) => break,
        }
    }
    exited
}
