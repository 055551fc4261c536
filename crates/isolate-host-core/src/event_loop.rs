//! I/O event loop driven by a main instance.
//!
//! The loop is a current-thread tokio runtime: nothing makes progress unless
//! the owning thread is inside [`EventLoop::block_on`]. Work spawned through
//! [`EventLoop::spawn`] is tracked so a run can wait until the loop has
//! nothing left to do.

use std::fmt;
use std::future::Future;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};
use uuid::Uuid;

use isolate_host_common::RuntimeError;

/// Unique identifier of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventLoopId(Uuid);

impl fmt::Display for EventLoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Single-threaded event loop with task tracking.
pub struct EventLoop {
    id: EventLoopId,
    runtime: Runtime,
    tracker: TaskTracker,
}

impl EventLoop {
    /// Start a new event loop with I/O and timers enabled.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::EventLoop`] if the runtime cannot be built.
    pub fn new() -> Result<Self, RuntimeError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RuntimeError::event_loop(format!("Failed to build runtime: {e}")))?;

        let id = EventLoopId(Uuid::new_v4());
        debug!(event_loop_id = %id, "Event loop created");

        Ok(Self {
            id,
            runtime,
            tracker: TaskTracker::new(),
        })
    }

    /// Get the event loop identifier.
    pub fn id(&self) -> EventLoopId {
        self.id
    }

    /// Spawn tracked work onto the loop.
    ///
    /// The task only makes progress while the loop is being driven.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(task, self.runtime.handle())
    }

    /// Number of tracked tasks that have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Drive the loop until `future` completes.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Drive `future` to completion, then keep driving the loop until every
    /// tracked task has finished.
    pub fn run_to_quiescence<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(async {
            let output = future.await;

            trace!(pending = self.tracker.len(), "Waiting for loop quiescence");
            self.tracker.close();
            self.tracker.wait().await;
            self.tracker.reopen();

            output
        })
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("pending_tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_block_on() {
        let event_loop = EventLoop::new().unwrap();
        let value = event_loop.block_on(async { 7 });

        assert_eq!(value, 7);
    }

    #[test]
    fn test_run_to_quiescence_waits_for_spawned_work() {
        let event_loop = EventLoop::new().unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        event_loop.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(event_loop.pending_tasks(), 1);

        let value = event_loop.run_to_quiescence(async { "main" });

        assert_eq!(value, "main");
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    #[test]
    fn test_loop_reusable_after_quiescence() {
        let event_loop = EventLoop::new().unwrap();

        event_loop.run_to_quiescence(async {});
        event_loop.spawn(async {});
        event_loop.run_to_quiescence(async {});

        assert_eq!(event_loop.pending_tasks(), 0);
    }
}
