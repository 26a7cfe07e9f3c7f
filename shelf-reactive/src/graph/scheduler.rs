//! Update Scheduler
//!
//! The scheduler owns the set of dirty nodes awaiting resolution, the FIFO
//! queue of subscriber callbacks, and the flags that keep flushing
//! coalesced and non-reentrant.
//!
//! # Algorithm
//!
//! 1. A write marks the written signal and, transitively, every observer
//!    dirty. Marking stops at nodes that are already dirty, so each node is
//!    visited once per tick even in diamond-shaped graphs.
//! 2. Marked nodes join the pending set and a flush is requested.
//! 3. A flush pass snapshots the pending set, sorts it by ascending level
//!    (creation order breaks ties) and resolves every node that is still
//!    dirty. A node therefore recomputes only after all of its sources were
//!    resolved in the same pass.
//! 4. Effects sit at the highest level, so they run after every computed.
//!    Subscriber callbacks queued during the pass are drained last.
//! 5. Work produced during the pass (an effect writing a signal) is left
//!    for the next pass, which is requested once this one ends.

use std::collections::VecDeque;

use indexmap::IndexSet;
use serde::Serialize;
use tracing::{debug, debug_span, error, warn};

use super::node::{NodeId, NodeType};
use crate::error::{FailurePhase, NodeFailure, ReactiveError, Result};
use crate::reactive::Runtime;

/// A subscriber notification waiting for the end of a flush pass.
pub(crate) struct QueuedCallback {
    /// Label of the node whose change produced the callback.
    pub(crate) origin: String,
    pub(crate) run: Box<dyn FnOnce()>,
}

/// Scheduler state of one runtime.
#[derive(Default)]
pub(crate) struct Scheduler {
    pending: IndexSet<NodeId>,
    queue: VecDeque<QueuedCallback>,
    /// A flush has been requested and not yet started.
    pub(crate) scheduled: bool,
    /// A flush pass is running.
    pub(crate) flushing: bool,
    /// Nesting depth of `batch` calls.
    pub(crate) batch_depth: usize,
    /// Consecutive passes that each left new work behind.
    pub(crate) chained_passes: usize,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_pending(&mut self, id: NodeId) {
        self.pending.insert(id);
    }

    pub(crate) fn remove_pending(&mut self, id: NodeId) {
        self.pending.shift_remove(&id);
    }

    pub(crate) fn enqueue(&mut self, callback: QueuedCallback) {
        self.queue.push_back(callback);
    }

    /// Whether anything is waiting for a flush.
    pub(crate) fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.queue.is_empty()
    }

    /// Drop all pending work. Used when a runaway cascade is cut off.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.queue.clear();
        self.scheduled = false;
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Outcome of a flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    /// Passes that ran.
    pub passes: usize,
    /// Computed values recomputed.
    pub recomputed: usize,
    /// Effect runs.
    pub effects: usize,
    /// Subscriber callbacks delivered.
    pub callbacks: usize,
    /// The call was ignored because a flush was already running.
    pub skipped: bool,
    /// The call was ignored because a batch is open.
    pub deferred_by_batch: bool,
}

impl FlushStats {
    fn absorb(&mut self, other: FlushStats) {
        self.passes += other.passes;
        self.recomputed += other.recomputed;
        self.effects += other.effects;
        self.callbacks += other.callbacks;
    }
}

/// Resets the flushing flag however the pass ends.
struct FlushingGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.rt.inner().scheduler.borrow_mut().flushing = false;
    }
}

/// Work a pass has taken but not finished. If the pass unwinds (a panic
/// with `catch_panics` off) the remainder goes back to the scheduler, still
/// dirty, so later flushes pick it up.
struct Unfinished<'a> {
    rt: &'a Runtime,
    nodes: VecDeque<(NodeId, NodeType)>,
    callbacks: VecDeque<QueuedCallback>,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() || (self.nodes.is_empty() && self.callbacks.is_empty()) {
            return;
        }
        let inner = self.rt.inner();
        let (Ok(mut graph), Ok(mut scheduler)) =
            (inner.graph.try_borrow_mut(), inner.scheduler.try_borrow_mut())
        else {
            return;
        };
        for (id, _) in self.nodes.drain(..) {
            if let Some(node) = graph.get_mut(id) {
                node.dirty = true;
                scheduler.pending.insert(id);
            }
        }
        for callback in self.callbacks.drain(..).rev() {
            scheduler.queue.push_front(callback);
        }
        warn!(
            pending = scheduler.pending.len(),
            queued = scheduler.queue.len(),
            "flush pass unwound; unfinished work requeued"
        );
    }
}

/// Run exactly one flush pass.
pub(crate) fn flush_pass(rt: &Runtime) -> Result<FlushStats> {
    let inner = rt.inner();
    let pending = {
        let mut scheduler = inner.scheduler.borrow_mut();
        if scheduler.flushing {
            warn!("flush requested while flushing; skipped");
            return Ok(FlushStats {
                skipped: true,
                ..FlushStats::default()
            });
        }
        if scheduler.batch_depth > 0 {
            // The outermost batch requests a new flush when it closes.
            scheduler.scheduled = false;
            return Ok(FlushStats {
                deferred_by_batch: true,
                ..FlushStats::default()
            });
        }
        scheduler.flushing = true;
        scheduler.scheduled = false;
        std::mem::take(&mut scheduler.pending)
    };
    let guard = FlushingGuard { rt };

    let span = debug_span!("flush", pending = pending.len());
    let _entered = span.enter();

    let mut order: Vec<(u32, u64, NodeId, NodeType)> = {
        let graph = inner.graph.borrow();
        pending
            .into_iter()
            .filter_map(|id| {
                graph
                    .get(id)
                    .map(|node| (node.level.get(), node.serial, id, node.node_type()))
            })
            .collect()
    };
    order.sort_unstable_by_key(|&(level, serial, _, _)| (level, serial));

    let mut stats = FlushStats {
        passes: 1,
        ..FlushStats::default()
    };
    let mut failures = Vec::new();
    let mut unfinished = Unfinished {
        rt,
        nodes: order
            .into_iter()
            .map(|(_, _, id, node_type)| (id, node_type))
            .collect(),
        callbacks: VecDeque::new(),
    };

    // A node leaves `unfinished` only once it has been resolved.
    while let Some(&(id, node_type)) = unfinished.nodes.front() {
        let still_dirty = inner
            .graph
            .borrow()
            .get(id)
            .is_some_and(|node| node.dirty);
        if !still_dirty {
            unfinished.nodes.pop_front();
            continue;
        }
        match node_type {
            NodeType::Signal => {
                if let Some(node) = inner.graph.borrow_mut().get_mut(id) {
                    node.dirty = false;
                }
                unfinished.nodes.pop_front();
                continue;
            }
            NodeType::Computed => stats.recomputed += 1,
            NodeType::Effect => stats.effects += 1,
        }
        let resolved = rt.resolve_node(id);
        unfinished.nodes.pop_front();
        if let Err(err) = resolved {
            let phase = match node_type {
                NodeType::Effect => FailurePhase::Effect,
                _ => FailurePhase::Compute,
            };
            let label = inner.graph.borrow().label(id);
            error!(node = %label, error = %err, "node failed during flush");
            failures.push(NodeFailure::from_error(label, phase, err));
        }
    }

    // Callbacks queued by the callbacks themselves wait for the next pass.
    unfinished.callbacks = std::mem::take(&mut inner.scheduler.borrow_mut().queue);
    while let Some(callback) = unfinished.callbacks.pop_front() {
        stats.callbacks += 1;
        if let Err(message) = rt.invoke(callback.run) {
            error!(node = %callback.origin, %message, "subscriber panicked");
            failures.push(NodeFailure {
                node: callback.origin,
                phase: FailurePhase::Subscriber,
                message,
            });
        }
    }

    drop(unfinished);
    drop(guard);

    let more_work = {
        let mut scheduler = inner.scheduler.borrow_mut();
        if scheduler.has_work() {
            scheduler.chained_passes += 1;
            true
        } else {
            scheduler.chained_passes = 0;
            false
        }
    };

    debug!(
        recomputed = stats.recomputed,
        effects = stats.effects,
        callbacks = stats.callbacks,
        failures = failures.len(),
        more_work,
        "flush pass finished"
    );

    if more_work {
        rt.request_flush();
    }

    if failures.is_empty() {
        Ok(stats)
    } else {
        Err(ReactiveError::Flush(failures))
    }
}

/// Run passes until no work is left or `max_flush_passes` is reached.
///
/// Failures from every pass are merged into one [`ReactiveError::Flush`].
pub(crate) fn run_until_idle(rt: &Runtime) -> Result<FlushStats> {
    let inner = rt.inner();
    let limit = inner.config.max_flush_passes;
    let mut total = FlushStats::default();
    let mut failures = Vec::new();

    for _ in 0..limit {
        if !inner.scheduler.borrow().has_work() {
            break;
        }
        match flush_pass(rt) {
            Ok(stats) if stats.skipped || stats.deferred_by_batch => return Ok(stats),
            Ok(stats) => total.absorb(stats),
            Err(ReactiveError::Flush(mut failed)) => {
                total.passes += 1;
                failures.append(&mut failed);
            }
            Err(other) => return Err(other),
        }
    }

    if inner.scheduler.borrow().has_work() {
        let dropped = {
            let mut scheduler = inner.scheduler.borrow_mut();
            let dropped = scheduler.pending_len();
            scheduler.clear();
            scheduler.chained_passes = 0;
            dropped
        };
        warn!(passes = limit, dropped, "flush limit reached; pending work dropped");
        return Err(ReactiveError::FlushLimit { passes: limit });
    }

    if failures.is_empty() {
        Ok(total)
    } else {
        Err(ReactiveError::Flush(failures))
    }
}
