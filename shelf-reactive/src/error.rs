//! Errors
//!
//! Every fallible operation in the runtime reports a [`ReactiveError`].
//! The ergonomic readers and writers (`get`, `set`, ...) panic with the
//! error's display text instead, the same way `RefCell::borrow` does; the
//! `try_*` variants hand the error back to the caller.

use std::any::Any;

use serde::Serialize;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors raised by the reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A handle was used after its node left the graph.
    #[error("reactive node {node} was disposed")]
    Disposed {
        /// Label of the disposed node.
        node: String,
    },

    /// The runtime that owned the handle no longer exists.
    #[error("the runtime owning this handle has been dropped")]
    RuntimeDropped,

    /// A computation read a value that is (transitively) derived from itself.
    #[error("dependency cycle detected while evaluating {node}")]
    Cycle {
        /// Label of the node that was read while it was being evaluated.
        node: String,
    },

    /// Nested evaluations went deeper than `max_tracking_depth`.
    #[error("tracking depth exceeded the limit of {depth} nested evaluations")]
    DepthExceeded {
        /// The configured limit.
        depth: usize,
    },

    /// A compute function or effect body panicked.
    #[error("computation of {node} failed: {message}")]
    ComputeFailed {
        /// Label of the failing node.
        node: String,
        /// The panic message.
        message: String,
    },

    /// An equality function panicked; the write was aborted.
    #[error("equality check for {node} panicked: {message}")]
    EqualityPanicked {
        /// Label of the signal or computed being compared.
        node: String,
        /// The panic message.
        message: String,
    },

    /// Cascading writes kept producing work past `max_flush_passes`.
    #[error("flush did not settle after {passes} passes")]
    FlushLimit {
        /// Number of passes that ran.
        passes: usize,
    },

    /// One or more nodes failed during a flush pass. The pass still ran to
    /// completion for every other node.
    #[error("{} node(s) failed during flush", .0.len())]
    Flush(Vec<NodeFailure>),

    /// The runtime configuration was rejected.
    #[error("invalid runtime configuration: {0}")]
    Config(String),

    /// A graph invariant does not hold. Only produced by
    /// [`Runtime::check_invariants`](crate::reactive::Runtime::check_invariants).
    #[error("graph invariant violated: {0}")]
    Invariant(String),
}

/// Where in a flush a node failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// While recomputing a computed value.
    Compute,
    /// While running an effect body or its cleanup.
    Effect,
    /// While delivering a queued subscriber notification.
    Subscriber,
}

/// A single isolated failure collected during a flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    /// Label of the node (or of the node that queued the callback).
    pub node: String,
    /// What was running.
    pub phase: FailurePhase,
    /// Error text.
    pub message: String,
}

impl NodeFailure {
    pub(crate) fn from_error(node: String, phase: FailurePhase, error: ReactiveError) -> Self {
        let message = match error {
            ReactiveError::ComputeFailed { message, .. } => message,
            other => other.to_string(),
        };
        Self { node, phase, message }
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
