//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computeds
//! and effects. It owns the dependency graph, the tracking stack and the
//! scheduler, and every handle it creates refers back to it.
//!
//! # How It Works
//!
//! 1. Creating a signal, computed or effect inserts a node into the graph.
//!
//! 2. When a computed or effect reads a value, the runtime links the value
//!    to the computation on top of the tracking stack.
//!
//! 3. When a signal's value changes, the runtime:
//!    a. Marks the signal and all transitive observers dirty
//!    b. Adds them to the pending set
//!    c. Requests a flush according to [`FlushMode`]
//!    d. Computeds read before the flush resolve on demand
//!
//! # Ownership
//!
//! A [`Runtime`] is a cheap, clonable handle. Signal, computed and effect
//! handles only hold a weak reference to it, so closures stored inside the
//! graph never keep the graph alive. Using a handle after the last runtime
//! clone is gone yields [`ReactiveError::RuntimeDropped`].
//!
//! # Threading
//!
//! The runtime is single-threaded: handles are neither `Send` nor `Sync`
//! and no locks are involved. Independent runtimes never share state.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use tracing::{error, trace, trace_span, warn};

use super::computed::{Computed, ComputedOptions};
use super::context::TrackingStack;
use super::effect::{Effect, IntoCleanup};
use super::signal::{Signal, SignalOptions};
use super::store::Store;
use crate::config::{FlushMode, RuntimeConfig};
use crate::error::{panic_message, ReactiveError, Result};
use crate::executor::Executor;
use crate::graph::{self, FlushStats, Graph, Node, NodeId, NodeType, QueuedCallback, Scheduler};

/// Shared state behind every [`Runtime`] clone.
pub(crate) struct Inner {
    pub(crate) graph: RefCell<Graph>,
    pub(crate) tracking: TrackingStack,
    pub(crate) scheduler: RefCell<Scheduler>,
    pub(crate) config: RuntimeConfig,
    errors: RefCell<Vec<ReactiveError>>,
    executor: Option<Rc<dyn Executor>>,
}

/// A reactive graph together with its scheduler.
///
/// # Example
///
/// ```rust
/// use shelf_reactive::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.signal(1);
///
/// let doubled = {
///     let count = count.clone();
///     rt.computed(move || count.get() * 2)
/// };
///
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<Inner>,
}

/// Weak reference held by handles.
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<Inner>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Result<Runtime> {
        self.0
            .upgrade()
            .map(|inner| Runtime { inner })
            .ok_or(ReactiveError::RuntimeDropped)
    }
}

/// Builder for a [`Runtime`] with non-default settings.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    executor: Option<Rc<dyn Executor>>,
}

impl RuntimeBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set only the flush mode.
    pub fn flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.config.flush_mode = flush_mode;
        self
    }

    /// Executor used by [`FlushMode::Deferred`].
    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Rc::new(executor));
        self
    }

    /// Validate the configuration and create the runtime.
    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        if self.config.flush_mode == FlushMode::Deferred && self.executor.is_none() {
            return Err(ReactiveError::Config(
                "deferred flush mode requires an executor".into(),
            ));
        }
        Ok(Runtime::from_parts(self.config, self.executor))
    }
}

/// Diagnostic view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Creation number.
    pub serial: u64,
    /// Debug name, if one was given.
    pub name: Option<String>,
    /// Node kind.
    pub kind: NodeType,
    /// Topological level; `None` for effects.
    pub level: Option<u32>,
    /// Whether the node is stale.
    pub dirty: bool,
    /// Serials of the nodes this node reads.
    pub sources: Vec<u64>,
    /// Serials of the nodes reading this node.
    pub observers: Vec<u64>,
}

/// Keeps the computing flag set for exactly as long as a resolution runs.
struct ComputingGuard<'a> {
    rt: &'a Runtime,
    id: NodeId,
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut graph) = self.rt.inner.graph.try_borrow_mut() {
            if let Some(node) = graph.get_mut(self.id) {
                node.computing = false;
            }
        }
    }
}

/// Puts a node's previous source edges back unless its tracked run
/// completes. Covers unwinding when `catch_panics` is off.
struct SourcesGuard<'a> {
    rt: &'a Runtime,
    id: NodeId,
    previous: Option<IndexSet<NodeId>>,
}

impl SourcesGuard<'_> {
    fn disarm(mut self) {
        self.previous = None;
    }
}

impl Drop for SourcesGuard<'_> {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        if let Ok(mut graph) = self.rt.inner.graph.try_borrow_mut() {
            graph.restore_sources(self.id, previous);
        }
    }
}

/// Holds one level of batch nesting.
struct BatchGuard<'a> {
    rt: &'a Runtime,
}

impl<'a> BatchGuard<'a> {
    fn enter(rt: &'a Runtime) -> Self {
        rt.inner.scheduler.borrow_mut().batch_depth += 1;
        Self { rt }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let reopen = {
            let mut scheduler = self.rt.inner.scheduler.borrow_mut();
            scheduler.batch_depth -= 1;
            scheduler.batch_depth == 0 && scheduler.has_work()
        };
        if reopen {
            self.rt.request_flush();
        }
    }
}

impl Runtime {
    /// Create a runtime with the default configuration (manual flushing).
    pub fn new() -> Self {
        Self::from_parts(RuntimeConfig::default(), None)
    }

    /// Start building a runtime with custom settings.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    fn from_parts(config: RuntimeConfig, executor: Option<Rc<dyn Executor>>) -> Self {
        Self {
            inner: Rc::new(Inner {
                graph: RefCell::new(Graph::new()),
                tracking: TrackingStack::new(),
                scheduler: RefCell::new(Scheduler::new()),
                config,
                errors: RefCell::new(Vec::new()),
                executor,
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.inner))
    }

    // ------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------

    /// Create a signal compared with `PartialEq`.
    pub fn signal<T>(&self, initial: T) -> Signal<T>
    where
        T: Clone + PartialEq + 'static,
    {
        Signal::create(self, initial, SignalOptions::default())
    }

    /// Create a signal with a name and/or custom equality.
    pub fn signal_with<T>(&self, initial: T, options: SignalOptions<T>) -> Signal<T>
    where
        T: Clone + 'static,
    {
        Signal::create(self, initial, options)
    }

    /// Create a lazily evaluated computed value compared with `PartialEq`.
    pub fn computed<T, F>(&self, compute: F) -> Computed<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn() -> T + 'static,
    {
        Computed::create(self, compute, ComputedOptions::default())
    }

    /// Create a computed value with a name and/or custom equality.
    pub fn computed_with<T, F>(&self, compute: F, options: ComputedOptions<T>) -> Computed<T>
    where
        T: Clone + 'static,
        F: Fn() -> T + 'static,
    {
        Computed::create(self, compute, options)
    }

    /// Create an effect. The body runs immediately and again after every
    /// change to what it read. It may return a [`Cleanup`](super::Cleanup)
    /// that runs before the next invocation and on disposal.
    pub fn effect<F, R>(&self, body: F) -> Effect
    where
        F: FnMut() -> R + 'static,
        R: IntoCleanup,
    {
        Effect::create(self, None, body)
    }

    /// Create a named effect.
    pub fn effect_named<F, R>(&self, name: impl Into<Cow<'static, str>>, body: F) -> Effect
    where
        F: FnMut() -> R + 'static,
        R: IntoCleanup,
    {
        Effect::create(self, Some(name.into()), body)
    }

    /// Create an empty keyed store.
    pub fn store<K, V>(&self) -> Store<K, V>
    where
        K: Hash + Eq + Clone + 'static,
        V: Clone + PartialEq + 'static,
    {
        Store::create(self)
    }

    // ------------------------------------------------------------------
    // Transactions and tracking
    // ------------------------------------------------------------------

    /// Run `f` as one transaction. No flush pass runs until the outermost
    /// batch returns, so effects observe only the final state.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _batch = BatchGuard::enter(self);
            f()
        };
        self.settle();
        result
    }

    /// Run `f` without recording dependencies for the current computation.
    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _frame = self.inner.tracking.enter_untracked();
            f()
        };
        self.settle();
        result
    }

    /// Whether a batch is open.
    pub fn is_batching(&self) -> bool {
        self.inner.scheduler.borrow().batch_depth > 0
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Run a single flush pass.
    ///
    /// Work created during the pass (an effect writing a signal) is left
    /// for the next pass. Per-node failures do not stop the pass; they are
    /// returned together as [`ReactiveError::Flush`].
    pub fn flush(&self) -> Result<FlushStats> {
        graph::flush_pass(self)
    }

    /// Run flush passes until the graph is settled.
    pub fn run_until_idle(&self) -> Result<FlushStats> {
        graph::run_until_idle(self)
    }

    /// Whether dirty nodes or callbacks are waiting for a flush.
    pub fn is_flush_pending(&self) -> bool {
        self.inner.scheduler.borrow().has_work()
    }

    /// Errors from flushes the runtime started on its own (immediate and
    /// deferred modes) and from effect creation.
    pub fn take_errors(&self) -> Vec<ReactiveError> {
        std::mem::take(&mut *self.inner.errors.borrow_mut())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.inner.graph.borrow().len()
    }

    /// Diagnostic view of one node.
    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        let graph = self.inner.graph.borrow();
        let node = graph.get(id)?;
        let serials = |ids: &IndexSet<NodeId>| -> Vec<u64> {
            ids.iter()
                .filter_map(|id| graph.get(*id).map(|n| n.serial))
                .collect()
        };
        Some(NodeInfo {
            serial: node.serial,
            name: node.name.as_ref().map(|name| name.to_string()),
            kind: node.node_type(),
            level: (!node.level.is_effect()).then(|| node.level.get()),
            dirty: node.dirty,
            sources: serials(&node.sources),
            observers: serials(&node.observers),
        })
    }

    /// Diagnostic view of the whole graph, ordered by creation.
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let ids: Vec<NodeId> = self.inner.graph.borrow().iter().map(|(id, _)| id).collect();
        let mut nodes: Vec<NodeInfo> = ids.into_iter().filter_map(|id| self.node_info(id)).collect();
        nodes.sort_by_key(|node| node.serial);
        nodes
    }

    /// Verify that every edge is stored on both endpoints and that every
    /// non-effect node sits above its sources.
    pub fn check_invariants(&self) -> Result<()> {
        self.inner.graph.borrow().check_invariants()
    }

    // ------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------

    pub(crate) fn insert_node(&self, node: Node) -> NodeId {
        let id = self.inner.graph.borrow_mut().insert(node);
        trace!(?id, "node created");
        id
    }

    /// Remove a node from the graph and the pending set.
    pub(crate) fn remove_node(&self, id: NodeId) -> bool {
        // Bind the node so it drops after the borrow ends.
        let removed = self.inner.graph.borrow_mut().remove(id);
        self.inner.scheduler.borrow_mut().remove_pending(id);
        removed.is_some()
    }

    pub(crate) fn label(&self, id: NodeId) -> String {
        self.inner.graph.borrow().label(id)
    }

    pub(crate) fn ensure_alive(&self, id: NodeId) -> Result<()> {
        self.inner.graph.borrow().require(id).map(|_| ())
    }

    /// `(dirty, computing)` flags of a live node.
    pub(crate) fn node_flags(&self, id: NodeId) -> Result<(bool, bool)> {
        let graph = self.inner.graph.borrow();
        let node = graph.require(id)?;
        Ok((node.dirty, node.computing))
    }

    pub(crate) fn source_count(&self, id: NodeId) -> usize {
        self.inner
            .graph
            .borrow()
            .get(id)
            .map_or(0, |node| node.sources.len())
    }

    pub(crate) fn observer_count(&self, id: NodeId) -> usize {
        self.inner
            .graph
            .borrow()
            .get(id)
            .map_or(0, |node| node.observers.len())
    }

    /// Whether reads are currently being recorded.
    pub(crate) fn is_tracking(&self) -> bool {
        self.inner.tracking.current().is_some()
    }

    /// Record a read of `source` by the current computation, if any.
    pub(crate) fn track(&self, source: NodeId) -> Result<()> {
        match self.inner.tracking.current() {
            Some(observer) => self
                .inner
                .graph
                .borrow_mut()
                .link(source, observer)
                .map(|_| ()),
            None => self.ensure_alive(source),
        }
    }

    /// Run `f` with `id` as the tracking frame, after tearing down the
    /// node's previous source edges.
    ///
    /// If `f` panics the old edges come back (alongside any tracked before
    /// the panic) so the node can still be invalidated. This holds whether
    /// the panic is caught or unwinds out of the runtime.
    pub(crate) fn run_tracked<R>(&self, id: NodeId, f: impl FnOnce() -> R) -> Result<R> {
        let frame = self
            .inner
            .tracking
            .enter(id, self.inner.config.max_tracking_depth)?;
        let sources = SourcesGuard {
            rt: self,
            id,
            previous: Some(self.inner.graph.borrow_mut().take_sources(id)),
        };
        let outcome = self.invoke(f);
        drop(frame);

        match outcome {
            Ok(value) => {
                sources.disarm();
                Ok(value)
            }
            Err(message) => {
                drop(sources);
                Err(ReactiveError::ComputeFailed {
                    node: self.label(id),
                    message,
                })
            }
        }
    }

    /// Call user code, turning a panic into its message when
    /// `catch_panics` is enabled.
    pub(crate) fn invoke<R>(&self, f: impl FnOnce() -> R) -> std::result::Result<R, String> {
        if self.inner.config.catch_panics {
            panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
        } else {
            Ok(f())
        }
    }

    /// Recompute a computed or rerun an effect, dispatching on its kind.
    pub(crate) fn resolve_node(&self, id: NodeId) -> Result<()> {
        let (resolver, serial, name) = {
            let mut graph = self.inner.graph.borrow_mut();
            let node = graph.get_mut(id).ok_or_else(|| ReactiveError::Disposed {
                node: format!("{id:?}"),
            })?;
            if node.computing {
                return Err(ReactiveError::Cycle { node: node.label() });
            }
            // Cleared up front so writes made during the run mark it again.
            node.dirty = false;
            let Some(resolver) = node.kind.resolver() else {
                return Ok(());
            };
            node.computing = true;
            (resolver, node.serial, node.name.clone())
        };

        let _span = trace_span!("resolve", serial, name = name.as_deref()).entered();
        let _computing = ComputingGuard { rt: self, id };
        resolver.resolve(self, id)
    }

    /// Mark `id` and everything downstream of it dirty.
    pub(crate) fn mark_dirty(&self, id: NodeId) {
        let mut marked = 0usize;
        {
            let mut graph = self.inner.graph.borrow_mut();
            let mut scheduler = self.inner.scheduler.borrow_mut();
            let mut work: SmallVec<[NodeId; 16]> = smallvec![id];

            while let Some(next) = work.pop() {
                let Some(node) = graph.get_mut(next) else {
                    continue;
                };
                // Signals always propagate: an observer pulled clean since
                // the previous write must be marked again.
                if node.dirty && !node.is_signal() {
                    continue;
                }
                node.dirty = true;
                marked += 1;
                scheduler.add_pending(next);
                work.extend(node.observers.iter().rev().copied());
            }
        }
        trace!(?id, marked, "dirty marked");
        if marked > 0 {
            self.request_flush();
        }
    }

    /// Queue a subscriber notification for the end of the next flush pass.
    pub(crate) fn enqueue(&self, origin: String, run: Box<dyn FnOnce()>) {
        self.inner
            .scheduler
            .borrow_mut()
            .enqueue(QueuedCallback { origin, run });
        self.request_flush();
    }

    /// Ask for a flush. Requests are coalesced until the flush starts.
    pub(crate) fn request_flush(&self) {
        let first_request = {
            let mut scheduler = self.inner.scheduler.borrow_mut();
            !std::mem::replace(&mut scheduler.scheduled, true)
        };
        if !first_request || self.inner.config.flush_mode != FlushMode::Deferred {
            return;
        }
        if let Some(executor) = &self.inner.executor {
            let weak = self.downgrade();
            executor.defer(Box::new(move || {
                if let Ok(rt) = weak.upgrade() {
                    rt.flush_deferred();
                }
            }));
        }
    }

    /// In [`FlushMode::Immediate`], flush now unless something is still
    /// in progress (a batch, a flush, or an evaluation).
    pub(crate) fn settle(&self) {
        if self.inner.config.flush_mode != FlushMode::Immediate || self.inner.tracking.is_active() {
            return;
        }
        {
            let scheduler = self.inner.scheduler.borrow();
            if scheduler.flushing || scheduler.batch_depth > 0 || !scheduler.has_work() {
                return;
            }
        }
        if let Err(err) = graph::run_until_idle(self) {
            error!(error = %err, "immediate flush failed");
            self.record_error(err);
        }
    }

    fn flush_deferred(&self) {
        let chained = self.inner.scheduler.borrow().chained_passes;
        if chained >= self.inner.config.max_flush_passes {
            {
                let mut scheduler = self.inner.scheduler.borrow_mut();
                scheduler.clear();
                scheduler.chained_passes = 0;
            }
            warn!(passes = chained, "flush limit reached; pending work dropped");
            self.record_error(ReactiveError::FlushLimit { passes: chained });
            return;
        }
        if let Err(err) = graph::flush_pass(self) {
            error!(error = %err, "deferred flush failed");
            self.record_error(err);
        }
    }

    pub(crate) fn record_error(&self, err: ReactiveError) {
        self.inner.errors.borrow_mut().push(err);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("flush_mode", &self.inner.config.flush_mode)
            .field("nodes", &self.node_count())
            .field("flush_pending", &self.is_flush_pending())
            .finish()
    }
}
