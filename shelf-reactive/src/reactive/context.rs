//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a signal or computed is
//! read, the runtime links it to the computation on top of the stack.
//!
//! # Implementation
//!
//! Each runtime owns one stack of frames. Evaluating a computed or an
//! effect pushes a frame naming that node; `untrack` pushes an empty frame
//! so that reads inside it link to nothing. Frames are popped by a guard,
//! so the stack stays balanced when a computation panics.

use std::cell::RefCell;

use crate::error::{ReactiveError, Result};
use crate::graph::NodeId;

/// The stack of evaluation frames of one runtime.
#[derive(Debug, Default)]
pub(crate) struct TrackingStack {
    frames: RefCell<Vec<Option<NodeId>>>,
}

/// Guard that pops its frame when dropped.
pub(crate) struct TrackingGuard<'a> {
    stack: &'a TrackingStack,
    frame: Option<NodeId>,
}

impl TrackingStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push a frame for `node`, failing if the stack is already
    /// `max_depth` frames deep.
    pub(crate) fn enter(&self, node: NodeId, max_depth: usize) -> Result<TrackingGuard<'_>> {
        let mut frames = self.frames.borrow_mut();
        if frames.len() >= max_depth {
            return Err(ReactiveError::DepthExceeded { depth: max_depth });
        }
        frames.push(Some(node));
        Ok(TrackingGuard {
            stack: self,
            frame: Some(node),
        })
    }

    /// Push an empty frame. Reads under it establish no edges.
    pub(crate) fn enter_untracked(&self) -> TrackingGuard<'_> {
        self.frames.borrow_mut().push(None);
        TrackingGuard {
            stack: self,
            frame: None,
        }
    }

    /// The node that should observe reads right now, if any.
    pub(crate) fn current(&self) -> Option<NodeId> {
        self.frames.borrow().last().copied().flatten()
    }

    /// Whether any frame (tracked or not) is open.
    pub(crate) fn is_active(&self) -> bool {
        self.depth() > 0
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.borrow().len()
    }
}

impl Drop for TrackingGuard<'_> {
    fn drop(&mut self) {
        let popped = self.stack.frames.borrow_mut().pop();

        // Guards are scoped, so frames always come off in push order.
        debug_assert_eq!(
            popped,
            Some(self.frame),
            "TrackingGuard mismatch: expected {:?}, got {:?}",
            self.frame,
            popped
        );
    }
}
