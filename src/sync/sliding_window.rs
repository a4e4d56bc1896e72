// src/sync/sliding_window.rs
//! Sliding-window worker pool
//!
//! Work items are queued with `add`, then `run` starts exactly `size` worker
//! threads that drain the queue in submission order and blocks until every
//! worker has exited. Workers stop when the queue is closed and empty, so
//! every queued item is executed unless the pool is killed.
//!
//! Shell items have their output captured; callables report success,
//! failure or panic. Either kind may carry a tag, and tagged outcomes are
//! collected in a results registry readable after `run` returns.

use crate::observability::METRIC_RUNNER_TASKS;
use crate::runtime::shell::{spawn_command, wait_for_output, ShellOutput};
use crate::sync::semaphore::Semaphore;
use crate::utils::errors::Result;
use crossbeam_channel::Receiver;
use dashmap::DashMap;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

type Callable = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A unit of work for the pool
pub enum WorkItem {
    /// Arbitrary closure
    Call(Callable),

    /// Command line run through `sh -c`
    Shell(String),
}

impl WorkItem {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        WorkItem::Call(Box::new(f))
    }

    pub fn shell(command: impl Into<String>) -> Self {
        WorkItem::Shell(command.into())
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::Call(_) => f.write_str("Call(..)"),
            WorkItem::Shell(command) => f.debug_tuple("Shell").field(command).finish(),
        }
    }
}

/// How a work item ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Panicked,
    Killed,
}

/// Outcome of a tagged work item
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,

    /// Captured output for shell items
    pub output: Option<ShellOutput>,

    /// Error description for failed or panicked items
    pub error: Option<String>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    fn from_error(status: TaskStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            output: None,
            error: Some(error.into()),
        }
    }
}

struct Queued {
    item: WorkItem,
    tag: Option<String>,
}

/// Handle that aborts a running pool from another thread
#[derive(Clone)]
pub struct KillHandle {
    killed: Arc<AtomicBool>,

    /// In-flight shell commands: item sequence number -> pid
    in_flight: Arc<DashMap<usize, u32>>,
}

impl KillHandle {
    /// Stop handing out work and SIGKILL every in-flight command
    ///
    /// Callables already running are left to finish; nothing is
    /// guaranteed about their results.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        for entry in self.in_flight.iter() {
            signal_kill(*entry.value());
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

fn signal_kill(pid: u32) {
    debug!("Sending SIGKILL to process group {}", pid);
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("PID {} already gone: {}", pid, e);
    }
}

/// Fixed-size worker pool over a pre-loaded queue
pub struct SlidingWindow {
    /// Number of worker threads
    size: usize,

    /// Items waiting for the next `run`
    pending: Mutex<Vec<Queued>>,

    /// Tag -> outcome
    results: Mutex<HashMap<String, TaskResult>>,

    /// Optional admission gate taken by every item before it executes
    gate: Option<Arc<Semaphore>>,

    handle: KillHandle,
}

impl SlidingWindow {
    /// Create a pool running `size` workers
    pub fn new(size: usize) -> Self {
        if size == 0 {
            warn!("Sliding window created with 0 workers, using 1");
        }
        Self {
            size: size.max(1),
            pending: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            gate: None,
            handle: KillHandle {
                killed: Arc::new(AtomicBool::new(false)),
                in_flight: Arc::new(DashMap::new()),
            },
        }
    }

    /// Share an admission semaphore; each item holds one unit while running
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queue an item; items added during `run` wait for the next `run`
    pub fn add(&self, item: WorkItem, tag: Option<String>) {
        self.pending.lock().push(Queued { item, tag });
    }

    /// Queue a shell command whose result is recorded under `tag`
    pub fn add_shell(&self, command: impl Into<String>, tag: impl Into<String>) {
        self.add(WorkItem::shell(command), Some(tag.into()));
    }

    /// Queue a closure whose outcome is recorded under `tag`
    pub fn add_call<F>(&self, tag: impl Into<String>, f: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.add(WorkItem::call(f), Some(tag.into()));
    }

    /// Number of items waiting for `run`
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Execute every queued item on `size` workers; returns how many ran
    pub fn run(&self) -> usize {
        let items = std::mem::take(&mut *self.pending.lock());
        let total = items.len();

        if self.handle.is_killed() {
            warn!("Sliding window was killed, dropping {} queued items", total);
            return 0;
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        for (seq, queued) in items.into_iter().enumerate() {
            // The receiver is alive, so sending cannot fail
            let _ = tx.send((seq, queued));
        }
        drop(tx);

        info!("Running {} items on {} workers", total, self.size);
        let executed = AtomicUsize::new(0);

        thread::scope(|scope| {
            for worker_id in 0..self.size {
                let rx = rx.clone();
                let executed = &executed;
                let spawned = thread::Builder::new()
                    .name(format!("sliding-window-{}", worker_id))
                    .spawn_scoped(scope, move || self.worker_loop(worker_id, rx, executed));
                if let Err(e) = spawned {
                    warn!("Failed to spawn worker {}: {}", worker_id, e);
                }
            }
        });

        let executed = executed.into_inner();
        debug!("Sliding window finished: {}/{} items executed", executed, total);
        executed
    }

    fn worker_loop(&self, worker_id: usize, rx: Receiver<(usize, Queued)>, executed: &AtomicUsize) {
        while let Ok((seq, queued)) = rx.recv() {
            if self.handle.is_killed() {
                debug!("Worker {} stopping, pool killed", worker_id);
                break;
            }

            let result = match &self.gate {
                Some(gate) => match gate.permit(1) {
                    Ok(_permit) => self.execute(seq, queued.item),
                    Err(e) => TaskResult::from_error(TaskStatus::Failed, e.to_string()),
                },
                None => self.execute(seq, queued.item),
            };

            executed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(METRIC_RUNNER_TASKS).increment(1);

            if let Some(tag) = queued.tag {
                self.results.lock().insert(tag, result);
            }
        }
    }

    fn execute(&self, seq: usize, item: WorkItem) -> TaskResult {
        match item {
            WorkItem::Call(f) => match catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(())) => TaskResult {
                    status: TaskStatus::Succeeded,
                    output: None,
                    error: None,
                },
                Ok(Err(e)) => TaskResult::from_error(TaskStatus::Failed, e.to_string()),
                Err(payload) => {
                    let message = panic_message(payload);
                    warn!("Work item panicked: {}", message);
                    TaskResult::from_error(TaskStatus::Panicked, message)
                }
            },
            WorkItem::Shell(command) => self.execute_shell(seq, &command),
        }
    }

    fn execute_shell(&self, seq: usize, command: &str) -> TaskResult {
        let child = match spawn_command(command) {
            Ok(child) => child,
            Err(e) => return TaskResult::from_error(TaskStatus::Failed, e.to_string()),
        };

        let pid = child.id();
        self.handle.in_flight.insert(seq, pid);
        // A kill issued before the pid was registered would have missed it
        if self.handle.is_killed() {
            signal_kill(pid);
        }

        let output = wait_for_output(command, child);
        self.handle.in_flight.remove(&seq);

        match output {
            Ok(output) => {
                let status = if output.success() {
                    TaskStatus::Succeeded
                } else if output.status.is_none() && self.handle.is_killed() {
                    TaskStatus::Killed
                } else {
                    TaskStatus::Failed
                };
                TaskResult {
                    status,
                    error: None,
                    output: Some(output),
                }
            }
            Err(e) => TaskResult::from_error(TaskStatus::Failed, e.to_string()),
        }
    }

    /// Tag -> outcome for every tagged item executed so far
    pub fn results(&self) -> HashMap<String, TaskResult> {
        self.results.lock().clone()
    }

    /// Abort the pool; see [`KillHandle::kill`]
    pub fn kill(&self) {
        self.handle.kill();
    }

    /// Handle for killing the pool from another thread while `run` blocks
    pub fn kill_handle(&self) -> KillHandle {
        self.handle.clone()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
