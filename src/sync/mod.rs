// src/sync/mod.rs
//! Admission-control primitives
//!
//! - **Semaphore**: counting gate bounding concurrently used units,
//!   with strict and relaxed (partial) acquisition
//! - **Sliding Window**: fixed-size worker pool draining a pre-loaded queue
//!   of shell commands and callables, collecting tagged results
//!
//! # Architecture
//!
//! ```text
//! SlidingWindow (pool_size workers)
//! ├─ Queue: [item1, item2, ...]  (closed once run() starts)
//! ├─ Workers: W threads pulling until the queue is drained
//! ├─ Gate: optional Semaphore capping running items beneath W
//! └─ Results: tag -> TaskResult
//! ```
//!
//! Both primitives block OS threads. There is no timeout built in; wrap the
//! work item itself when a deadline is needed.

pub mod semaphore;
pub mod sliding_window;

pub use semaphore::{Semaphore, SemaphorePermit};
pub use sliding_window::{KillHandle, SlidingWindow, TaskResult, TaskStatus, WorkItem};
