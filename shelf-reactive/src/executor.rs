//! Deferred Execution
//!
//! In [`FlushMode::Deferred`](crate::config::FlushMode::Deferred) the
//! runtime does not flush inline. It posts a single task per tick to an
//! [`Executor`], and every write made before that task runs is coalesced
//! into the same flush.
//!
//! Two executors ship with the crate:
//!
//! - [`MicrotaskQueue`]: a FIFO the host drains explicitly, e.g. once per
//!   frame or at the end of an event handler.
//! - `TokioLocalExecutor` (feature `tokio`): spawns onto the current
//!   `tokio::task::LocalSet`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + 'static>;

/// Something that can run a task later on the current thread.
pub trait Executor {
    /// Schedule `task` to run after the current synchronous work finishes.
    fn defer(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Rc<E> {
    fn defer(&self, task: Task) {
        (**self).defer(task);
    }
}

/// A host-driven task queue.
///
/// Clones share the same queue, so one clone can be handed to the runtime
/// and another kept by the host to drain it.
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl MicrotaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run tasks in FIFO order until the queue is empty, including tasks
    /// queued by the tasks themselves. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the task runs; tasks may defer more work.
            let next = self.tasks.borrow_mut().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Executor for MicrotaskQueue {
    fn defer(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Runs deferred flushes as local tokio tasks.
///
/// Must be used from within a `tokio::task::LocalSet`; the runtime's
/// handles are not `Send`.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLocalExecutor;

#[cfg(feature = "tokio")]
impl Executor for TokioLocalExecutor {
    fn defer(&self, task: Task) {
        drop(tokio::task::spawn_local(async move { task() }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn queue_runs_in_fifo_order() {
        let queue = MicrotaskQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            queue.defer(Box::new(move || log.borrow_mut().push(i)));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn tasks_queued_while_draining_also_run() {
        let queue = MicrotaskQueue::new();
        let hits = Rc::new(Cell::new(0));

        let inner_queue = queue.clone();
        let inner_hits = hits.clone();
        queue.defer(Box::new(move || {
            inner_hits.set(inner_hits.get() + 1);
            let hits = inner_hits.clone();
            inner_queue.defer(Box::new(move || hits.set(hits.get() + 10)));
        }));

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(hits.get(), 11);
    }
}
