//! Effects
//!
//! Effects are side effects that run when their dependencies change. They
//! are the leaves of the reactive graph, where reactive values meet the
//! outside world (DOM updates, persistence, logging).
//!
//! # How Effects Work
//!
//! 1. The body runs once, immediately, tracking what it reads
//! 2. A change to any of those values marks the effect dirty
//! 3. The next flush reruns it after every computed has settled
//! 4. If the previous run returned a [`Cleanup`], it runs first
//!
//! Dropping an [`Effect`] handle does not stop the effect; call
//! [`Effect::dispose`] for that.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::error;

use super::runtime::{Runtime, WeakRuntime};
use crate::error::{ReactiveError, Result};
use crate::graph::{Node, NodeId, NodeKind, Resolve};

/// Teardown returned by an effect body.
pub struct Cleanup(Box<dyn FnOnce()>);

impl Cleanup {
    /// Wrap a closure to run before the next body run and on dispose.
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Box::new(f))
    }

    fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}

/// Values an effect body may return.
pub trait IntoCleanup {
    /// The cleanup to keep, if any.
    fn into_cleanup(self) -> Option<Cleanup>;
}

impl IntoCleanup for () {
    fn into_cleanup(self) -> Option<Cleanup> {
        None
    }
}

impl IntoCleanup for Cleanup {
    fn into_cleanup(self) -> Option<Cleanup> {
        Some(self)
    }
}

impl IntoCleanup for Option<Cleanup> {
    fn into_cleanup(self) -> Option<Cleanup> {
        self
    }
}

type Body = Box<dyn FnMut() -> Option<Cleanup>>;

pub(crate) struct EffectCell {
    body: RefCell<Body>,
    cleanup: RefCell<Option<Cleanup>>,
    runs: Cell<usize>,
    disposed: Cell<bool>,
}

impl EffectCell {
    fn take_cleanup(&self) -> Option<Cleanup> {
        self.cleanup.borrow_mut().take()
    }
}

impl Resolve for EffectCell {
    fn resolve(&self, rt: &Runtime, id: NodeId) -> Result<()> {
        if self.disposed.get() {
            return Ok(());
        }

        let cleanup_failure = match self.take_cleanup() {
            Some(cleanup) => rt.invoke(|| cleanup.run()).err(),
            None => None,
        };

        let mut body = self
            .body
            .try_borrow_mut()
            .map_err(|_| ReactiveError::Cycle { node: rt.label(id) })?;
        self.runs.set(self.runs.get() + 1);
        let outcome = rt.run_tracked(id, || (*body)());
        drop(body);

        let cleanup = outcome?;
        if self.disposed.get() {
            // The body disposed its own effect.
            if let Some(cleanup) = cleanup {
                if let Err(message) = rt.invoke(|| cleanup.run()) {
                    error!(node = ?id, %message, "cleanup panicked");
                }
            }
        } else {
            *self.cleanup.borrow_mut() = cleanup;
        }

        match cleanup_failure {
            Some(message) => Err(ReactiveError::ComputeFailed {
                node: rt.label(id),
                message: format!("cleanup panicked: {message}"),
            }),
            None => Ok(()),
        }
    }
}

/// Handle to a running effect.
#[derive(Clone)]
pub struct Effect {
    rt: WeakRuntime,
    id: NodeId,
    cell: Rc<EffectCell>,
}

impl Effect {
    pub(crate) fn create<F, R>(rt: &Runtime, name: Option<Cow<'static, str>>, mut body: F) -> Self
    where
        F: FnMut() -> R + 'static,
        R: IntoCleanup,
    {
        let cell = Rc::new(EffectCell {
            body: RefCell::new(Box::new(move || body().into_cleanup())),
            cleanup: RefCell::new(None),
            runs: Cell::new(0),
            disposed: Cell::new(false),
        });
        let resolver: Rc<dyn Resolve> = cell.clone();
        let id = rt.insert_node(Node::new(NodeKind::Effect(resolver), name));

        if let Err(err) = rt.resolve_node(id) {
            error!(node = %rt.label(id), error = %err, "effect failed on first run");
            rt.record_error(err);
        }
        rt.settle();

        Self {
            rt: rt.downgrade(),
            id,
            cell,
        }
    }

    /// The node id of this effect.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// How many times the body has run.
    pub fn run_count(&self) -> usize {
        self.cell.runs.get()
    }

    /// Number of values read during the last run.
    pub fn source_count(&self) -> usize {
        self.rt.upgrade().map_or(0, |rt| rt.source_count(self.id))
    }

    /// Stop the effect and run its last cleanup. Idempotent.
    pub fn dispose(&self) {
        if self.cell.disposed.replace(true) {
            return;
        }
        if let Ok(rt) = self.rt.upgrade() {
            rt.remove_node(self.id);
        }
        if let Some(cleanup) = self.cell.take_cleanup() {
            cleanup.run();
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called, from outside or
    /// from the body itself.
    pub fn is_disposed(&self) -> bool {
        self.cell.disposed.get()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("runs", &self.cell.runs.get())
            .field("disposed", &self.cell.disposed.get())
            .finish()
    }
}
